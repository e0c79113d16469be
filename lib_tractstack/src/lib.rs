//! # lib_tractstack
//!
//! Client-side visitor plumbing for TractStack pages: session acquisition,
//! the realtime invalidation channel, engagement (dwell time) telemetry and
//! ordered belief updates. All outbound calls share one `EventTransport`.
//!
//! Components are constructed once by [`VisitorRuntime`] and handed to each
//! other explicitly; nothing in this crate lives in a global.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Client configuration: defaults, file/env layering and validation.
pub mod configs;
/// Dwell-time tracking for content regions.
pub mod engagement;
/// Belief (preference) updates, including the two-phase identity protocol.
pub mod preferences;
/// Single server-push connection per session.
pub mod realtime;
/// Outbound HTTP helper shared by every component.
pub mod retrieve;
/// Composition root wiring all components for one page lifetime.
pub mod runtime;
/// Session identity, readiness signal and durable client-side storage.
pub mod session;
/// Small shared helpers.
pub mod utils;

// --- Public API Re-exports ---
pub use configs::client_config::{ClientConfig, ConfigError};
pub use engagement::{
    DwellLedger, DwellVerdict, EngagementSignal, EngagementTracker, RegionVerdict,
    GLOSSED_THRESHOLD_MS, READ_THRESHOLD_MS,
};
pub use preferences::{BeliefMutation, PreferenceCoordinator, PreferenceError, PreferenceUpdate};
pub use realtime::{ChannelConfig, ChannelEvent, ConnectionState, RealtimeChannel};
pub use retrieve::transport::{ApiResponse, EventTransport, RequestIdentity, TransportError};
pub use runtime::{RuntimeError, VisitorRuntime};
pub use session::{
    DurableStore, FileStore, MemoryStore, SessionBroker, SessionContext, SessionSnapshot, StoreError,
};
