//! # Preference Coordinator
//!
//! Sends belief mutations to the state endpoint, one at a time, in the order
//! they were requested, and never before the session is ready.
//!
//! `IdentifyAs` is the one mutation that takes two calls: the backend must
//! see the old identity cleared before the new one is declared, so the unset
//! call is awaited to settlement before the set call goes out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::retrieve::transport::{EventTransport, RequestIdentity, TransportError, STATE_PATH};
use crate::session::context::SessionContext;

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("Unset call failed: {0}")]
    Unset(#[source] TransportError),

    #[error("Set call failed: {0}")]
    Set(#[source] TransportError),

    #[error("Mutation names no belief")]
    EmptyMutation,
}

/// One belief value as declared by a widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceUpdate {
    pub belief_id: String,
    pub belief_type: String,
    pub value: String,
    pub pane_id: Option<String>,
}

impl PreferenceUpdate {
    pub fn new(belief_id: &str, belief_type: &str, value: &str) -> Self {
        Self {
            belief_id: belief_id.to_string(),
            belief_type: belief_type.to_string(),
            value: value.to_string(),
            pane_id: None,
        }
    }

    pub fn in_pane(mut self, pane_id: &str) -> Self {
        self.pane_id = Some(pane_id.to_string());
        self
    }

    fn set_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("beliefId", self.belief_id.clone()),
            ("beliefType", self.belief_type.clone()),
            ("beliefValue", self.value.clone()),
        ];
        if let Some(pane_id) = &self.pane_id {
            fields.push(("paneId", pane_id.clone()));
        }
        fields
    }

    fn unset_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("beliefId", self.belief_id.clone()),
            ("beliefType", self.belief_type.clone()),
            ("unsetBeliefIds", self.belief_id.clone()),
        ];
        if let Some(pane_id) = &self.pane_id {
            fields.push(("paneId", pane_id.clone()));
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeliefMutation {
    /// Plain single-call update.
    Set(PreferenceUpdate),
    /// Identity declaration: unset the belief, then set it.
    IdentifyAs(PreferenceUpdate),
    /// Clears one or more beliefs.
    Unset {
        belief_ids: Vec<String>,
        pane_id: Option<String>,
    },
}

impl BeliefMutation {
    fn is_empty(&self) -> bool {
        match self {
            BeliefMutation::Set(update) | BeliefMutation::IdentifyAs(update) => {
                update.belief_id.is_empty()
            }
            BeliefMutation::Unset { belief_ids, .. } => {
                belief_ids.iter().all(|id| id.is_empty())
            }
        }
    }
}

fn unset_many_fields(belief_ids: &[String], pane_id: Option<&str>) -> Vec<(&'static str, String)> {
    let ids: Vec<&str> = belief_ids
        .iter()
        .map(String::as_str)
        .filter(|id| !id.is_empty())
        .collect();
    let mut fields = vec![
        ("beliefId", ids.first().copied().unwrap_or_default().to_string()),
        ("unsetBeliefIds", ids.join(",")),
    ];
    if let Some(pane_id) = pane_id {
        fields.push(("paneId", pane_id.to_string()));
    }
    fields
}

/// Serializes belief mutations behind session readiness.
///
/// Cloning is not offered; share it behind an `Arc`.
pub struct PreferenceCoordinator {
    context: SessionContext,
    transport: EventTransport,
    // tokio's mutex queues waiters FIFO.
    queue: tokio::sync::Mutex<()>,
    cache: Mutex<HashMap<(String, String), String>>,
}

impl PreferenceCoordinator {
    pub fn new(context: SessionContext, transport: EventTransport) -> Self {
        Self {
            context,
            transport,
            queue: tokio::sync::Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fire-and-forget form of [`PreferenceCoordinator::apply`].
    pub async fn update(&self, mutation: BeliefMutation) {
        if let Err(e) = self.apply(mutation).await {
            log::warn!("Preference update failed: {}", e);
        }
    }

    /// Sends one mutation and reports how it went.
    ///
    /// For `IdentifyAs` a failed unset is logged and the set call still goes
    /// out; the result reflects the set call.
    pub async fn apply(&self, mutation: BeliefMutation) -> Result<(), PreferenceError> {
        if mutation.is_empty() {
            return Err(PreferenceError::EmptyMutation);
        }

        let _turn = self.queue.lock().await;
        let snapshot = self.context.wait_ready().await;
        let identity = snapshot.identity();
        let storyfragment_id = snapshot.storyfragment_id;

        match mutation {
            BeliefMutation::Set(update) => {
                let outcome = self
                    .send(&identity, &update.set_fields())
                    .await
                    .map_err(PreferenceError::Set);
                self.remember(&storyfragment_id, &update.belief_id, Some(&update.value));
                outcome
            }
            BeliefMutation::IdentifyAs(update) => {
                if let Err(e) = self.send(&identity, &update.unset_fields()).await {
                    log::warn!("{}; sending set for {} anyway", PreferenceError::Unset(e), update.belief_id);
                }
                let outcome = self
                    .send(&identity, &update.set_fields())
                    .await
                    .map_err(PreferenceError::Set);
                self.remember(&storyfragment_id, &update.belief_id, Some(&update.value));
                outcome
            }
            BeliefMutation::Unset {
                belief_ids,
                pane_id,
            } => {
                let fields = unset_many_fields(&belief_ids, pane_id.as_deref());
                let outcome = self
                    .send(&identity, &fields)
                    .await
                    .map_err(PreferenceError::Unset);
                for belief_id in &belief_ids {
                    self.remember(&storyfragment_id, belief_id, None);
                }
                outcome
            }
        }
    }

    /// Last value dispatched for a belief on a storyfragment.
    pub fn last_value(&self, storyfragment_id: &str, belief_id: &str) -> Option<String> {
        self.cache()
            .get(&(storyfragment_id.to_string(), belief_id.to_string()))
            .cloned()
    }

    async fn send(
        &self,
        identity: &RequestIdentity,
        fields: &[(&str, String)],
    ) -> Result<(), TransportError> {
        self.transport.send_form(STATE_PATH, identity, fields).await
    }

    fn remember(&self, storyfragment_id: &str, belief_id: &str, value: Option<&str>) {
        let key = (storyfragment_id.to_string(), belief_id.to_string());
        let mut cache = self.cache();
        match value {
            Some(value) => {
                cache.insert(key, value.to_string());
            }
            None => {
                cache.remove(&key);
            }
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<(String, String), String>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PreferenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceCoordinator")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
