//! # Engagement Tracker
//!
//! Single-consumer actor that turns visibility signals into dwell-time
//! telemetry. The host (whatever watches the viewport) pushes
//! [`EngagementSignal`]s into the sender returned by
//! [`EngagementTracker::new`]; the tracker processes them strictly in order.
//!
//! Signals carry their own timestamps, so time spent waiting for session
//! readiness or for a slow POST never inflates a measured duration.
//!
//! The tracker remembers which storyfragment its current page belongs to and
//! stamps every emission with it. Hosts may move the shared session to the
//! next storyfragment as soon as they navigate; the old page's flush still
//! goes out under the old id.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::configs::client_config::ClientConfig;
use crate::engagement::ledger::{DwellLedger, RegionVerdict};
use crate::retrieve::transport::{EventTransport, TransportError, STATE_PATH};
use crate::session::context::SessionContext;
use crate::session::store::{DurableStore, ENTERED_KEY};
use crate::utils::now_ms;

/// Input to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum EngagementSignal {
    /// A watched region's visible area ratio changed.
    Visibility {
        region_id: String,
        ratio: f64,
        at: u64,
    },
    /// Page exit: close every open observation at `at`.
    Flush { at: u64 },
    /// Soft navigation to another storyfragment with a new set of regions.
    Navigate {
        storyfragment_id: String,
        regions: Vec<String>,
        at: u64,
    },
    /// Flush and stop the actor.
    Shutdown { at: u64 },
}

pub struct EngagementTracker {
    ledger: DwellLedger,
    watched: HashSet<String>,
    page_storyfragment: String,
    visibility_threshold: f64,
    page_viewed: bool,
    context: SessionContext,
    transport: EventTransport,
    store: Arc<dyn DurableStore>,
    receiver: mpsc::UnboundedReceiver<EngagementSignal>,
}

impl EngagementTracker {
    /// Builds the tracker watching `regions` and returns the signal sender.
    pub fn new(
        config: &ClientConfig,
        context: SessionContext,
        transport: EventTransport,
        store: Arc<dyn DurableStore>,
        regions: Vec<String>,
    ) -> (Self, mpsc::UnboundedSender<EngagementSignal>) {
        let (tx, receiver) = mpsc::unbounded_channel();
        let tracker = Self {
            ledger: DwellLedger::with_thresholds(
                config.glossed_threshold_ms(),
                config.read_threshold_ms(),
            ),
            watched: regions.into_iter().collect(),
            page_storyfragment: context.snapshot().storyfragment_id,
            visibility_threshold: config.visibility_threshold(),
            page_viewed: false,
            context,
            transport,
            store,
            receiver,
        };
        (tracker, tx)
    }

    /// Announces the page view, then processes signals until `Shutdown` or
    /// until every sender is dropped (treated as page exit).
    pub async fn run(mut self) {
        self.announce_page_view().await;

        while let Some(signal) = self.receiver.recv().await {
            if !self.handle(signal).await {
                return;
            }
        }

        let verdicts = self.ledger.flush(now_ms());
        self.emit_verdicts(verdicts).await;
        log::debug!("Engagement tracker stopped: all senders dropped");
    }

    async fn handle(&mut self, signal: EngagementSignal) -> bool {
        match signal {
            EngagementSignal::Visibility {
                region_id,
                ratio,
                at,
            } => {
                if !self.watched.contains(&region_id) {
                    log::trace!("Ignoring visibility for unwatched region {}", region_id);
                    return true;
                }
                if ratio >= self.visibility_threshold {
                    self.ledger.enter(&region_id, at);
                } else if let Some(verdict) = self.ledger.leave(&region_id, at) {
                    self.emit_verdicts(vec![verdict]).await;
                }
                true
            }
            EngagementSignal::Flush { at } => {
                let verdicts = self.ledger.flush(at);
                self.emit_verdicts(verdicts).await;
                true
            }
            EngagementSignal::Navigate {
                storyfragment_id,
                regions,
                at,
            } => {
                // Old page first, under the old storyfragment header.
                let verdicts = self.ledger.flush(at);
                self.emit_verdicts(verdicts).await;

                self.watched = regions.into_iter().collect();
                self.page_viewed = false;
                if self.context.snapshot().storyfragment_id != storyfragment_id {
                    self.context.set_storyfragment(&storyfragment_id);
                }
                self.page_storyfragment = storyfragment_id;
                self.announce_page_view().await;
                true
            }
            EngagementSignal::Shutdown { at } => {
                let verdicts = self.ledger.flush(at);
                self.emit_verdicts(verdicts).await;
                false
            }
        }
    }

    /// ENTERED (once per visitor, ever) and PAGEVIEWED (once per page view).
    async fn announce_page_view(&mut self) {
        if self.page_viewed {
            return;
        }
        self.page_viewed = true;

        let storyfragment_id = self.page_storyfragment.clone();
        if storyfragment_id.is_empty() {
            log::debug!("No storyfragment for this page; skipping page view events");
            return;
        }

        if !self.has_entered() {
            let fields = story_fields(&storyfragment_id, "ENTERED");
            match self.send_state(&fields).await {
                Ok(()) => {
                    if let Err(e) = self.store.set(ENTERED_KEY, "1") {
                        log::warn!("Could not persist ENTERED flag: {}", e);
                    }
                }
                Err(e) => log::warn!("ENTERED event not delivered: {}", e),
            }
        }

        let fields = story_fields(&storyfragment_id, "PAGEVIEWED");
        if let Err(e) = self.send_state(&fields).await {
            log::warn!("PAGEVIEWED event for {} not delivered: {}", storyfragment_id, e);
        }
    }

    fn has_entered(&self) -> bool {
        match self.store.get(ENTERED_KEY) {
            Ok(flag) => flag.is_some(),
            Err(e) => {
                // Unknown; err towards not double counting.
                log::warn!("Could not read ENTERED flag: {}", e);
                true
            }
        }
    }

    async fn emit_verdicts(&self, verdicts: Vec<RegionVerdict>) {
        for verdict in verdicts {
            log::debug!(
                "Region {} {} after {}ms",
                verdict.region_id,
                verdict.verdict.as_str(),
                verdict.duration_ms
            );
            let fields = vec![
                ("beliefId", verdict.region_id.clone()),
                ("beliefType", "Pane".to_string()),
                ("beliefValue", verdict.verdict.as_str().to_string()),
                ("paneId", verdict.region_id.clone()),
                ("duration", verdict.duration_ms.to_string()),
            ];
            if let Err(e) = self.send_state(&fields).await {
                log::warn!(
                    "{} event for region {} not delivered: {}",
                    verdict.verdict.as_str(),
                    verdict.region_id,
                    e
                );
            }
        }
    }

    async fn send_state(&self, fields: &[(&str, String)]) -> Result<(), TransportError> {
        let mut identity = self.context.wait_ready().await.identity();
        identity.storyfragment_id =
            (!self.page_storyfragment.is_empty()).then(|| self.page_storyfragment.clone());
        self.transport.send_form(STATE_PATH, &identity, fields).await
    }
}

fn story_fields(storyfragment_id: &str, value: &str) -> Vec<(&'static str, String)> {
    vec![
        ("beliefId", storyfragment_id.to_string()),
        ("beliefType", "StoryFragment".to_string()),
        ("beliefValue", value.to_string()),
    ]
}
