//! # Data Retrieval Module
//!
//! The single outbound HTTP path of the crate. The session broker, the
//! engagement tracker and the preference coordinator all deliver their
//! payloads through [`transport::EventTransport`], which owns header
//! injection, encoding, retries and response handling.

/// Header-injecting HTTP client with retry middleware.
pub mod transport;
