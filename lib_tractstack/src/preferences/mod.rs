//! # Preferences Module
//!
//! Session-gated, strictly ordered belief updates.

/// Mutation kinds, their wire encoding and the serializing coordinator.
pub mod coordinator;

pub use coordinator::{BeliefMutation, PreferenceCoordinator, PreferenceError, PreferenceUpdate};
