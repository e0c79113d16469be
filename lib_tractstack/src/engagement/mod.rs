//! # Engagement Module
//!
//! Measures how long content regions stay in view and reports the ones that
//! were glossed over or read.
//!
//! - **`ledger`**: the pure dwell-time bookkeeping and classification.
//! - **`tracker`**: the actor that feeds the ledger from host signals and
//!   delivers verdicts and page-view events through the transport.

/// Dwell observations and threshold classification.
pub mod ledger;
/// Signal-driven actor emitting engagement telemetry.
pub mod tracker;

pub use ledger::{DwellLedger, DwellVerdict, RegionVerdict, GLOSSED_THRESHOLD_MS, READ_THRESHOLD_MS};
pub use tracker::{EngagementSignal, EngagementTracker};
