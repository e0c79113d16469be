//! # Realtime Module
//!
//! Server-initiated invalidation events over a single `text/event-stream`
//! connection.
//!
//! - **`sse`**: incremental event-stream decoder.
//! - **`channel`**: [`RealtimeChannel`], the connection owner and its state
//!   machine, re-broadcasting decoded events on a `tokio::sync::broadcast`
//!   channel.

/// Connection lifecycle and event re-broadcast.
pub mod channel;
/// `text/event-stream` wire decoding.
pub mod sse;

pub use channel::{ChannelConfig, ChannelError, ChannelEvent, ConnectionState, RealtimeChannel, SSE_PATH};
pub use sse::{LineTooLong, SseDecoder, SseFrame, MAX_LINE_BYTES};
