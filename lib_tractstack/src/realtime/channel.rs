//! # Realtime Channel
//!
//! Owns the page's one server-push connection to
//! `<backend>/api/v1/auth/sse`. The connection is keyed by session and
//! tenant: a storyfragment change (soft navigation) only updates config,
//! while a new session or tenant replaces the connection. Named events are
//! JSON-decoded and re-broadcast so consumers never touch the transport.
//!
//! There is no automatic reconnect. After an error the connection reference
//! is cleared and the next lifecycle call (`ensure_connected`, a config
//! change, or an explicit `start_connection`) opens a fresh one.
//!
//! Methods that open connections spawn onto the current tokio runtime.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::realtime::sse::{SseDecoder, SseFrame};
use crate::session::context::SessionSnapshot;

pub const SSE_PATH: &str = "/api/v1/auth/sse";
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Lifecycle of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Open,
    Errored,
    Closed,
}

/// Connection settings. `None` fields are "not provided" when merging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub backend_url: Option<String>,
    pub session_id: Option<String>,
    pub tenant_id: Option<String>,
    pub storyfragment_id: Option<String>,
}

impl ChannelConfig {
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            backend_url: non_empty(&snapshot.backend_url),
            session_id: snapshot.session_id.clone(),
            tenant_id: non_empty(&snapshot.tenant_id),
            storyfragment_id: non_empty(&snapshot.storyfragment_id),
        }
    }

    // 'other' overrides 'self' for Some values
    pub fn merge(self, other: ChannelConfig) -> ChannelConfig {
        ChannelConfig {
            backend_url: other.backend_url.or(self.backend_url),
            session_id: other.session_id.or(self.session_id),
            tenant_id: other.tenant_id.or(self.tenant_id),
            storyfragment_id: other.storyfragment_id.or(self.storyfragment_id),
        }
    }

    /// The stream URL, or `None` while the backend or session is unknown.
    pub fn stream_url(&self) -> Result<Option<Url>, ChannelError> {
        let (Some(backend), Some(session_id)) = (&self.backend_url, &self.session_id) else {
            return Ok(None);
        };
        let mut url = Url::parse(&format!("{}{}", backend.trim_end_matches('/'), SSE_PATH))?;
        url.query_pairs_mut()
            .append_pair("sessionId", session_id)
            .append_pair(
                "storyfragmentId",
                self.storyfragment_id.as_deref().unwrap_or_default(),
            )
            .append_pair("tenantId", self.tenant_id.as_deref().unwrap_or_default());
        Ok(Some(url))
    }
}

/// A decoded push event, re-broadcast to local subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub name: String,
    pub payload: Value,
}

impl ChannelEvent {
    /// Ids of the content regions the server reports as changed.
    pub fn pane_ids(&self) -> Vec<String> {
        self.payload
            .get("panes")
            .or_else(|| self.payload.get("paneIds"))
            .and_then(Value::as_array)
            .map(|panes| {
                panes
                    .iter()
                    .filter_map(|p| p.as_str().or_else(|| p.get("id").and_then(Value::as_str)))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn storyfragment_id(&self) -> Option<&str> {
        self.payload.get("storyfragmentId").and_then(Value::as_str)
    }
}

struct Connection {
    generation: u64,
    cancel: CancellationToken,
}

struct Shared {
    config: ChannelConfig,
    state: ConnectionState,
    connection: Option<Connection>,
    generation: u64,
    initialized: bool,
}

/// The page's realtime channel.
///
/// Build one per page lifetime and share it behind an `Arc`; a second
/// `initialize` on the same instance only merges config.
pub struct RealtimeChannel {
    client: reqwest::Client,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl RealtimeChannel {
    pub fn new(connect_timeout: Duration) -> Result<Self, ChannelError> {
        // No overall timeout: the stream is meant to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            client,
            shared: Arc::new(Mutex::new(Shared {
                config: ChannelConfig::default(),
                state: ConnectionState::Uninitialized,
                connection: None,
                generation: 0,
                initialized: false,
            })),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn config(&self) -> ChannelConfig {
        self.lock().config.clone()
    }

    /// `true` while a connection is connecting or open.
    pub fn has_connection(&self) -> bool {
        self.lock().connection.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// First call stores config and connects if a session is known. Later
    /// calls are treated as config updates, then reconnect if no connection
    /// is live.
    pub fn initialize(&self, config: ChannelConfig) {
        let should_start = {
            let mut shared = self.lock();
            if shared.initialized {
                None
            } else {
                shared.initialized = true;
                shared.config = shared.config.clone().merge(config.clone());
                Some(shared.config.session_id.is_some() && shared.connection.is_none())
            }
        };
        match should_start {
            None => {
                log::debug!("Realtime channel already initialized; merging config");
                self.update_config(config);
                // Re-init is a retry point after an error.
                self.ensure_connected();
            }
            Some(true) => {
                self.start_connection();
            }
            Some(false) => log::debug!("Realtime channel initialized without a session"),
        }
    }

    /// Merges `partial` into the stored config. Reconnects only when the
    /// session or tenant identity changed, or a session became available
    /// while nothing is connected.
    pub fn update_config(&self, partial: ChannelConfig) {
        let should_start = {
            let mut shared = self.lock();
            let before = shared.config.clone();
            shared.config = before.clone().merge(partial);
            let after = &shared.config;

            let identity_changed = before.session_id.is_some()
                && (before.session_id != after.session_id || before.tenant_id != after.tenant_id);
            let newly_available = before.session_id.is_none() && after.session_id.is_some();

            after.session_id.is_some()
                && (identity_changed || (newly_available && shared.connection.is_none()))
        };
        if should_start {
            self.start_connection();
        }
    }

    /// Opens a connection unless one is already live. Used to retry after an
    /// error on the next lifecycle event.
    pub fn ensure_connected(&self) -> bool {
        let needs_start = {
            let shared = self.lock();
            shared.connection.is_none() && shared.config.session_id.is_some()
        };
        needs_start && self.start_connection()
    }

    /// Closes any prior connection, then opens a new one.
    ///
    /// Returns `false` when there is nothing to connect to yet.
    pub fn start_connection(&self) -> bool {
        let mut shared = self.lock();

        let url = match shared.config.stream_url() {
            Ok(Some(url)) => url,
            Ok(None) => {
                log::debug!("Realtime channel has no session yet; not connecting");
                return false;
            }
            Err(e) => {
                log::error!("Cannot build realtime URL: {}", e);
                shared.state = ConnectionState::Errored;
                return false;
            }
        };

        if let Some(previous) = shared.connection.take() {
            log::debug!("Closing realtime connection #{}", previous.generation);
            previous.cancel.cancel();
        }

        shared.generation += 1;
        let generation = shared.generation;
        let cancel = CancellationToken::new();
        shared.connection = Some(Connection {
            generation,
            cancel: cancel.clone(),
        });
        shared.state = ConnectionState::Connecting;
        log::info!("Opening realtime connection #{}: {}", generation, url);

        tokio::spawn(run_connection(
            self.client.clone(),
            url,
            generation,
            cancel,
            Arc::clone(&self.shared),
            self.events.clone(),
        ));
        true
    }

    /// Closes the live connection, if any.
    pub fn close(&self) {
        let mut shared = self.lock();
        if let Some(connection) = shared.connection.take() {
            log::info!("Closing realtime connection #{}", connection.generation);
            connection.cancel.cancel();
        }
        if shared.state != ConnectionState::Uninitialized {
            shared.state = ConnectionState::Closed;
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(connection) = self.lock().connection.take() {
            connection.cancel.cancel();
        }
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Applies `state` only if `generation` is still the live connection.
/// Terminal states also clear the connection reference.
fn transition(shared: &Mutex<Shared>, generation: u64, state: ConnectionState) {
    let mut guard = lock_shared(shared);
    let is_current = guard
        .connection
        .as_ref()
        .is_some_and(|c| c.generation == generation);
    if !is_current {
        return;
    }
    if matches!(state, ConnectionState::Errored | ConnectionState::Closed) {
        guard.connection = None;
    }
    guard.state = state;
}

async fn run_connection(
    client: reqwest::Client,
    url: Url,
    generation: u64,
    cancel: CancellationToken,
    shared: Arc<Mutex<Shared>>,
    events: broadcast::Sender<ChannelEvent>,
) {
    let connect = client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send();

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = connect => result.and_then(|r| r.error_for_status()),
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            log::error!("Realtime connection #{} failed: {}", generation, e);
            transition(&shared, generation, ConnectionState::Errored);
            return;
        }
    };

    transition(&shared, generation, ConnectionState::Open);
    log::info!("Realtime connection #{} open", generation);

    let mut stream = Box::pin(response.bytes_stream());
    let mut decoder = SseDecoder::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("Realtime connection #{} cancelled", generation);
                return;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => match decoder.push(&bytes) {
                    Ok(frames) => {
                        for frame in frames {
                            dispatch(&events, frame);
                        }
                    }
                    Err(e) => {
                        log::error!("Realtime connection #{} dropped: {}", generation, e);
                        transition(&shared, generation, ConnectionState::Errored);
                        return;
                    }
                },
                Some(Err(e)) => {
                    log::error!("Realtime connection #{} read error: {}", generation, e);
                    transition(&shared, generation, ConnectionState::Errored);
                    return;
                }
                None => {
                    log::warn!("Realtime connection #{} closed by server", generation);
                    transition(&shared, generation, ConnectionState::Closed);
                    return;
                }
            }
        }
    }
}

fn dispatch(events: &broadcast::Sender<ChannelEvent>, frame: SseFrame) {
    let name = frame.event.unwrap_or_else(|| "message".to_string());
    match serde_json::from_str::<Value>(&frame.data) {
        Ok(payload) => {
            log::debug!("Realtime event '{}'", name);
            // An error only means nobody is subscribed right now.
            let _ = events.send(ChannelEvent { name, payload });
        }
        Err(e) => log::warn!("Dropping malformed '{}' payload: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_url() {
        let config = ChannelConfig {
            backend_url: Some("http://localhost:8080/".to_string()),
            session_id: Some("s 1".to_string()),
            tenant_id: Some("default".to_string()),
            storyfragment_id: Some("home".to_string()),
        };
        let url = config.stream_url().unwrap().unwrap();
        assert_eq!(url.path(), SSE_PATH);
        assert_eq!(
            url.query(),
            Some("sessionId=s+1&storyfragmentId=home&tenantId=default")
        );
    }

    #[test]
    fn test_stream_url_requires_session() {
        let config = ChannelConfig {
            backend_url: Some("http://localhost:8080".to_string()),
            ..Default::default()
        };
        assert_eq!(config.stream_url().unwrap(), None);
    }

    #[test]
    fn test_merge_keeps_unspecified_fields() {
        let base = ChannelConfig {
            backend_url: Some("http://b".to_string()),
            session_id: Some("s".to_string()),
            tenant_id: Some("t".to_string()),
            storyfragment_id: Some("home".to_string()),
        };
        let merged = base.merge(ChannelConfig {
            storyfragment_id: Some("about".to_string()),
            ..Default::default()
        });
        assert_eq!(merged.session_id.as_deref(), Some("s"));
        assert_eq!(merged.storyfragment_id.as_deref(), Some("about"));
    }

    #[test]
    fn test_pane_ids_accepts_strings_and_objects() {
        let event = ChannelEvent {
            name: "panes_updated".to_string(),
            payload: json!({"storyfragmentId": "home", "panes": ["p1", {"id": "p2"}, 3]}),
        };
        assert_eq!(event.pane_ids(), vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(event.storyfragment_id(), Some("home"));
    }

    #[tokio::test]
    async fn test_dispatch_drops_malformed_payloads() {
        let (tx, mut rx) = broadcast::channel(4);
        dispatch(
            &tx,
            SseFrame {
                event: Some("panes_updated".to_string()),
                data: "{not json".to_string(),
                id: None,
            },
        );
        dispatch(
            &tx,
            SseFrame {
                event: None,
                data: "{\"ok\":true}".to_string(),
                id: None,
            },
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "message");
        assert_eq!(event.payload, json!({"ok": true}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_without_session_is_a_noop() {
        let channel = RealtimeChannel::new(Duration::from_secs(1)).unwrap();
        channel.initialize(ChannelConfig {
            backend_url: Some("http://127.0.0.1:9".to_string()),
            ..Default::default()
        });
        assert!(!channel.has_connection());
        assert_eq!(channel.state(), ConnectionState::Uninitialized);
        assert!(!channel.ensure_connected());
    }
}
