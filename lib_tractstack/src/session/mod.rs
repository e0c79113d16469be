//! # Session Module
//!
//! Everything that identifies the visitor to the backend:
//!
//! - **`context`**: the shared [`SessionContext`] holding the current session
//!   fields and the one-shot readiness signal every outbound call waits on.
//! - **`store`**: the durable client-side key/value store (`DurableStore`)
//!   used for the persisted session id and one-time visitor flags.
//! - **`broker`**: [`SessionBroker`], which resolves a session id by
//!   validating a stored one, creating a new one, or degrading to a locally
//!   generated fallback.

/// Session acquisition, validation and fallback.
pub mod broker;
/// Shared session state and the readiness signal.
pub mod context;
/// Durable key/value storage for session and visitor flags.
pub mod store;

pub use broker::{is_fallback_id, SessionBroker, StoredSession, FALLBACK_PREFIX};
pub use context::{SessionContext, SessionSnapshot};
pub use store::{DurableStore, FileStore, MemoryStore, StoreError, ENTERED_KEY, SESSION_KEY};
