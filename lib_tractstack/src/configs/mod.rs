//! # Configuration Modules
//!
//! Client configuration for a TractStack page: where the backend lives, which
//! tenant and storyfragment the page belongs to, and the timing knobs used by
//! the session, transport and engagement components.

/// Layered client configuration (defaults, JSON file, environment).
pub mod client_config;
