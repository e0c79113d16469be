//! # Visitor Runtime
//!
//! One explicit composition root per page lifetime. It owns the session
//! context, the broker, the realtime channel, the preference coordinator and
//! the engagement tracker task, and wires them together in page-load order:
//!
//! 1. establish the session (fires readiness),
//! 2. initialize the realtime channel with the resolved identity,
//! 3. start the engagement tracker for the page's regions.
//!
//! Hosts that need a component directly borrow it through the accessors;
//! nothing here is global.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::configs::client_config::{ClientConfig, ConfigError};
use crate::engagement::tracker::{EngagementSignal, EngagementTracker};
use crate::preferences::coordinator::PreferenceCoordinator;
use crate::realtime::channel::{ChannelConfig, ChannelError, RealtimeChannel};
use crate::retrieve::transport::{EventTransport, TransportError};
use crate::session::broker::SessionBroker;
use crate::session::context::{SessionContext, SessionSnapshot};
use crate::session::store::DurableStore;
use crate::utils::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Realtime channel setup failed: {0}")]
    Channel(#[from] ChannelError),
}

#[derive(Default)]
struct TrackerHandle {
    signals: Option<mpsc::UnboundedSender<EngagementSignal>>,
    task: Option<JoinHandle<()>>,
}

pub struct VisitorRuntime {
    config: ClientConfig,
    context: SessionContext,
    transport: EventTransport,
    store: Arc<dyn DurableStore>,
    broker: SessionBroker,
    channel: Arc<RealtimeChannel>,
    preferences: Arc<PreferenceCoordinator>,
    tracker: Mutex<TrackerHandle>,
}

impl VisitorRuntime {
    pub fn new(config: ClientConfig, store: Arc<dyn DurableStore>) -> Result<Self, RuntimeError> {
        config.validate()?;

        let transport = EventTransport::from_config(&config)?;
        let context = SessionContext::from_config(&config);
        let broker = SessionBroker::from_config(
            &config,
            transport.clone(),
            Arc::clone(&store),
            context.clone(),
        );
        let channel = Arc::new(RealtimeChannel::new(config.request_timeout())?);
        let preferences = Arc::new(PreferenceCoordinator::new(
            context.clone(),
            transport.clone(),
        ));

        Ok(Self {
            config,
            context,
            transport,
            store,
            broker,
            channel,
            preferences,
            tracker: Mutex::new(TrackerHandle::default()),
        })
    }

    /// Page load. Returns the sender the host uses to report visibility.
    ///
    /// Calling it again after a successful start keeps the running tracker
    /// and returns its sender.
    pub async fn start(&self, regions: Vec<String>) -> mpsc::UnboundedSender<EngagementSignal> {
        let snapshot = self.broker.establish().await;
        self.channel.initialize(ChannelConfig::from_snapshot(&snapshot));

        let mut handle = self.tracker_handle();
        if let Some(signals) = handle.signals.as_ref().filter(|s| !s.is_closed()) {
            log::debug!("Engagement tracker already running");
            return signals.clone();
        }

        let (tracker, signals) = EngagementTracker::new(
            &self.config,
            self.context.clone(),
            self.transport.clone(),
            Arc::clone(&self.store),
            regions,
        );
        handle.task = Some(tokio::spawn(tracker.run()));
        handle.signals = Some(signals.clone());
        log::info!(
            "Visitor runtime started for storyfragment '{}'",
            snapshot.storyfragment_id
        );
        signals
    }

    /// Client-side navigation to another storyfragment.
    ///
    /// The session moves to the new storyfragment before this returns, so
    /// calls made on the new page carry its id. The tracker flushes the old
    /// page under the storyfragment it was tracking.
    pub fn soft_navigate(&self, storyfragment_id: &str, regions: Vec<String>) {
        self.context.set_storyfragment(storyfragment_id);
        self.channel.update_config(ChannelConfig {
            storyfragment_id: Some(storyfragment_id.to_string()),
            ..Default::default()
        });
        self.channel.ensure_connected();

        self.send_signal(EngagementSignal::Navigate {
            storyfragment_id: storyfragment_id.to_string(),
            regions,
            at: now_ms(),
        });
    }

    /// Page exit: flush dwell time and close the push connection.
    pub fn page_exit(&self) {
        self.send_signal(EngagementSignal::Flush { at: now_ms() });
        self.channel.close();
    }

    /// Stops the tracker after a final flush and waits for its last
    /// emissions, then closes the push connection.
    pub async fn shutdown(&self) {
        let task = {
            let mut handle = self.tracker_handle();
            if let Some(signals) = handle.signals.take() {
                let _ = signals.send(EngagementSignal::Shutdown { at: now_ms() });
            }
            handle.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Engagement tracker task failed: {}", e);
            }
        }
        self.channel.close();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn session(&self) -> SessionSnapshot {
        self.context.snapshot()
    }

    pub fn channel(&self) -> Arc<RealtimeChannel> {
        Arc::clone(&self.channel)
    }

    pub fn preferences(&self) -> Arc<PreferenceCoordinator> {
        Arc::clone(&self.preferences)
    }

    /// The tracker's signal sender, once `start` has run.
    pub fn signals(&self) -> Option<mpsc::UnboundedSender<EngagementSignal>> {
        self.tracker_handle().signals.clone()
    }

    fn send_signal(&self, signal: EngagementSignal) {
        match self.tracker_handle().signals.as_ref() {
            Some(signals) => {
                if signals.send(signal).is_err() {
                    log::warn!("Engagement tracker has stopped; signal dropped");
                }
            }
            None => log::debug!("Engagement tracker not started; signal dropped"),
        }
    }

    fn tracker_handle(&self) -> MutexGuard<'_, TrackerHandle> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for VisitorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorRuntime")
            .field("context", &self.context)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemoryStore;

    fn config(backend: &str, tenant: &str) -> ClientConfig {
        ClientConfig {
            backend_url: Some(backend.to_string()),
            tenant_id: Some(tenant.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = VisitorRuntime::new(config("not a url", "default"), Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(RuntimeError::Config(_))));

        let result = VisitorRuntime::new(
            config("http://127.0.0.1:9", " "),
            Arc::new(MemoryStore::new()),
        );
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_signals_before_start_are_dropped() {
        let runtime = VisitorRuntime::new(
            config("http://127.0.0.1:9", "default"),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        assert!(runtime.signals().is_none());
        runtime.soft_navigate("about", vec!["p1".to_string()]);
        runtime.page_exit();
        assert!(!runtime.session().ready);
    }
}
