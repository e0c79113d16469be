//! # Utilities Module
//!
//! General-purpose helpers shared across `lib_tractstack`.

/// Wall-clock helpers expressed in epoch milliseconds.
pub mod clock;

pub use clock::now_ms;
