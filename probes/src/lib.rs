//! # probes
//!
//! Headless drivers for exercising `lib_tractstack` against a live backend.

pub mod probe_logic;
