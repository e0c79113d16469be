//! # Realtime Channel Integration Tests
//!
//! Connection lifecycle of `RealtimeChannel` against a mock event stream.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{MockBackend, MockResponse};
use lib_tractstack::realtime::{MAX_LINE_BYTES, SSE_PATH};
use lib_tractstack::{ChannelConfig, ConnectionState, RealtimeChannel};

fn config(base_url: &str, session_id: &str) -> ChannelConfig {
    ChannelConfig {
        backend_url: Some(base_url.to_string()),
        session_id: Some(session_id.to_string()),
        tenant_id: Some("default".to_string()),
        storyfragment_id: Some("home".to_string()),
    }
}

async fn wait_for_state(channel: &RealtimeChannel, expected: ConnectionState) {
    for _ in 0..500 {
        if channel.state() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("state stayed {:?}, expected {:?}", channel.state(), expected);
}

fn event_stream() -> MockResponse {
    MockResponse::EventStream(vec![
        ": keep-alive\n\n".to_string(),
        "event: panes_updated\ndata: {not json\n\n".to_string(),
        "event: panes_updated\ndata: {\"storyfragmentId\":\"home\",\"panes\":[\"p1\",\"p2\"]}\n\n"
            .to_string(),
    ])
}

#[tokio::test]
async fn test_repeated_initialize_opens_one_connection() {
    let backend = MockBackend::start(|_| event_stream()).await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();
    let mut events = channel.subscribe();

    channel.initialize(config(&backend.url(), "sess-1"));
    channel.initialize(config(&backend.url(), "sess-1"));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event received")
        .unwrap();
    assert_eq!(event.name, "panes_updated");
    assert_eq!(event.pane_ids(), vec!["p1".to_string(), "p2".to_string()]);
    assert_eq!(event.storyfragment_id(), Some("home"));

    // The malformed frame before it was dropped without affecting state.
    assert!(events.try_recv().is_err());
    wait_for_state(&channel, ConnectionState::Open).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let connects = backend.requests_to(SSE_PATH);
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].method, "GET");
    assert_eq!(connects[0].header("accept"), Some("text/event-stream"));
    assert_eq!(connects[0].query_param("sessionId").as_deref(), Some("sess-1"));
    assert_eq!(connects[0].query_param("storyfragmentId").as_deref(), Some("home"));
    assert_eq!(connects[0].query_param("tenantId").as_deref(), Some("default"));

    channel.close();
    assert_eq!(channel.state(), ConnectionState::Closed);
    assert!(!channel.has_connection());
}

#[tokio::test]
async fn test_storyfragment_change_keeps_connection() {
    let backend = MockBackend::start(|_| event_stream()).await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();

    channel.initialize(config(&backend.url(), "sess-1"));
    wait_for_state(&channel, ConnectionState::Open).await;

    channel.update_config(ChannelConfig {
        storyfragment_id: Some("about".to_string()),
        ..Default::default()
    });
    assert!(!channel.ensure_connected());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.requests_to(SSE_PATH).len(), 1);
    assert_eq!(channel.config().storyfragment_id.as_deref(), Some("about"));
    assert_eq!(channel.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_session_change_replaces_connection() {
    let backend = MockBackend::start(|_| event_stream()).await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();

    channel.initialize(config(&backend.url(), "sess-1"));
    wait_for_state(&channel, ConnectionState::Open).await;

    channel.update_config(ChannelConfig {
        session_id: Some("sess-2".to_string()),
        ..Default::default()
    });

    let connects = backend.wait_for(SSE_PATH, 2).await;
    assert_eq!(connects.len(), 2);
    assert_eq!(connects[1].query_param("sessionId").as_deref(), Some("sess-2"));
    wait_for_state(&channel, ConnectionState::Open).await;
    assert!(channel.has_connection());
}

#[tokio::test]
async fn test_session_arriving_later_starts_connection() {
    let backend = MockBackend::start(|_| event_stream()).await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();

    channel.initialize(ChannelConfig {
        backend_url: Some(backend.url()),
        tenant_id: Some("default".to_string()),
        ..Default::default()
    });
    assert_eq!(channel.state(), ConnectionState::Uninitialized);

    channel.update_config(ChannelConfig {
        session_id: Some("sess-1".to_string()),
        ..Default::default()
    });
    wait_for_state(&channel, ConnectionState::Open).await;
    assert_eq!(backend.requests_to(SSE_PATH).len(), 1);
}

#[tokio::test]
async fn test_error_clears_connection_for_retry() {
    let backend = MockBackend::start(|_| MockResponse::Text(500, "nope".to_string())).await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();

    channel.initialize(config(&backend.url(), "sess-1"));
    wait_for_state(&channel, ConnectionState::Errored).await;
    assert!(!channel.has_connection());

    // No automatic retry; the next lifecycle call reconnects.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.requests_to(SSE_PATH).len(), 1);

    assert!(channel.ensure_connected());
    backend.wait_for(SSE_PATH, 2).await;
    wait_for_state(&channel, ConnectionState::Errored).await;
    assert_eq!(backend.requests_to(SSE_PATH).len(), 2);
}

#[tokio::test]
async fn test_server_end_of_stream_closes() {
    let backend = MockBackend::start(|_| MockResponse::Text(200, String::new())).await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();

    channel.initialize(config(&backend.url(), "sess-1"));
    wait_for_state(&channel, ConnectionState::Closed).await;
    assert!(!channel.has_connection());
}

#[tokio::test]
async fn test_reinitialize_reconnects_after_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let backend = MockBackend::start(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            MockResponse::Text(500, "warming up".to_string())
        } else {
            event_stream()
        }
    })
    .await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();

    channel.initialize(config(&backend.url(), "sess-1"));
    wait_for_state(&channel, ConnectionState::Errored).await;

    channel.initialize(config(&backend.url(), "sess-1"));
    assert_eq!(backend.wait_for(SSE_PATH, 2).await.len(), 2);
    wait_for_state(&channel, ConnectionState::Open).await;
    assert!(channel.has_connection());

    // Open again: a further initialize is a no-op.
    channel.initialize(config(&backend.url(), "sess-1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.requests_to(SSE_PATH).len(), 2);
    channel.close();
}

#[tokio::test]
async fn test_oversized_line_errors_the_connection() {
    let backend = MockBackend::start(|_| {
        MockResponse::EventStream(vec![format!("data: {}", "x".repeat(MAX_LINE_BYTES + 1))])
    })
    .await;
    let channel = RealtimeChannel::new(Duration::from_secs(2)).unwrap();
    let mut events = channel.subscribe();

    channel.initialize(config(&backend.url(), "sess-1"));
    wait_for_state(&channel, ConnectionState::Errored).await;
    assert!(!channel.has_connection());
    assert!(events.try_recv().is_err());
}
