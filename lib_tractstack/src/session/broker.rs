//! # Session Broker
//!
//! Resolves the visitor's session id. A stored id is probed against the
//! backend first; a rejected, expired or unverifiable id is discarded and a
//! new one requested. When the backend cannot hand out an id at all, a local
//! `ssr-fallback-*` id keeps the page usable in an unsynchronized mode.
//!
//! Nothing here fails to the caller: every path ends in *some* session id.

use std::sync::Arc;
use std::time::Duration;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::configs::client_config::ClientConfig;
use crate::retrieve::transport::{EventTransport, RequestIdentity, TransportError};
use crate::session::context::{SessionContext, SessionSnapshot};
use crate::session::store::{DurableStore, StoreError, SESSION_KEY};
use crate::utils::now_ms;

pub const VISIT_PATH: &str = "/api/v1/auth/visit";
pub const FALLBACK_PREFIX: &str = "ssr-fallback-";
const FALLBACK_SUFFIX_LEN: usize = 9;

/// The persisted `{sessionId, expiry}` record. `expiry` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub session_id: String,
    pub expiry: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VisitRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisitResponse {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    success: Option<bool>,
}

#[derive(Debug, PartialEq, Eq)]
enum Validation {
    Valid,
    /// The backend answered the probe with a different id.
    Replaced(String),
    Invalid,
}

/// Acquires, validates and persists the session id.
pub struct SessionBroker {
    transport: EventTransport,
    store: Arc<dyn DurableStore>,
    context: SessionContext,
    ttl: Duration,
}

impl SessionBroker {
    pub fn new(
        transport: EventTransport,
        store: Arc<dyn DurableStore>,
        context: SessionContext,
        ttl: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            context,
            ttl,
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        transport: EventTransport,
        store: Arc<dyn DurableStore>,
        context: SessionContext,
    ) -> Self {
        Self::new(transport, store, context, config.session_ttl())
    }

    /// Acquires a session id for `tenant_id` and fires readiness on the
    /// shared context. Repeated calls after readiness return the existing
    /// session without touching the network.
    pub async fn establish(&self) -> SessionSnapshot {
        let snapshot = self.context.snapshot();
        if snapshot.ready {
            return snapshot;
        }
        let session_id = self.acquire(&snapshot.tenant_id).await;
        self.context.mark_ready(&session_id);
        self.context.snapshot()
    }

    /// Resolves a session id, preferring a backend-confirmed one.
    pub async fn acquire(&self, tenant_id: &str) -> String {
        if tenant_id.trim().is_empty() {
            log::warn!("No tenant configured; using a local fallback session");
            return fallback_session_id();
        }

        if let Some(stored) = self.load_stored() {
            match self.validate(tenant_id, &stored.session_id).await {
                Validation::Valid => {
                    log::debug!("Stored session {} confirmed", stored.session_id);
                    return stored.session_id;
                }
                Validation::Replaced(session_id) => {
                    log::info!(
                        "Backend replaced stored session {} with {}",
                        stored.session_id,
                        session_id
                    );
                    self.persist(&session_id);
                    return session_id;
                }
                Validation::Invalid => {
                    log::info!("Discarding stale session {}", stored.session_id);
                    self.discard();
                }
            }
        }

        match self.create(tenant_id).await {
            Ok(session_id) => {
                self.persist(&session_id);
                session_id
            }
            Err(e) => {
                let fallback = fallback_session_id();
                log::warn!(
                    "Session creation failed ({}); continuing with {}",
                    e,
                    fallback
                );
                fallback
            }
        }
    }

    fn load_stored(&self) -> Option<StoredSession> {
        let raw = match self.store.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Could not read stored session: {}", e);
                return None;
            }
        };
        match serde_json::from_str::<StoredSession>(&raw) {
            Ok(stored) if stored.expiry > now_ms() && !stored.session_id.is_empty() => Some(stored),
            Ok(stored) => {
                log::debug!("Stored session {} expired", stored.session_id);
                self.discard();
                None
            }
            Err(e) => {
                log::warn!("Unreadable stored session ({}); discarding", e);
                self.discard();
                None
            }
        }
    }

    fn persist(&self, session_id: &str) {
        let record = StoredSession {
            session_id: session_id.to_string(),
            expiry: now_ms() + self.ttl.as_millis() as u64,
        };
        let result = serde_json::to_string(&record)
            .map_err(StoreError::from)
            .and_then(|raw| self.store.set(SESSION_KEY, &raw));
        if let Err(e) = result {
            log::warn!("Could not persist session {}: {}", session_id, e);
        }
    }

    fn discard(&self) {
        if let Err(e) = self.store.remove(SESSION_KEY) {
            log::warn!("Could not discard stored session: {}", e);
        }
    }

    async fn validate(&self, tenant_id: &str, session_id: &str) -> Validation {
        let identity = RequestIdentity {
            tenant_id: tenant_id.to_string(),
            session_id: Some(session_id.to_string()),
            storyfragment_id: None,
        };
        let body = VisitRequest {
            session_id: Some(session_id),
        };
        let probe = self.transport.post_json::<VisitResponse, _>(VISIT_PATH, &identity, &body);

        let response = match tokio::time::timeout(self.transport.timeout(), probe).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                log::warn!("Session validation failed: {}", e);
                return Validation::Invalid;
            }
            Err(_) => {
                log::warn!("Session validation timed out");
                return Validation::Invalid;
            }
        };

        let data = match response.expect_success() {
            Ok(Some(data)) => data,
            Ok(None) => return Validation::Invalid,
            Err(e) => {
                log::warn!("Session validation rejected: {}", e);
                return Validation::Invalid;
            }
        };

        match (data.success, data.session_id) {
            (Some(false), _) => Validation::Invalid,
            (_, Some(id)) if !id.is_empty() && id != session_id => Validation::Replaced(id),
            (Some(true), _) => Validation::Valid,
            (None, Some(id)) if id == session_id => Validation::Valid,
            _ => Validation::Invalid,
        }
    }

    async fn create(&self, tenant_id: &str) -> Result<String, TransportError> {
        let identity = RequestIdentity::tenant(tenant_id);
        let body = VisitRequest { session_id: None };
        let request = self.transport.post_json::<VisitResponse, _>(VISIT_PATH, &identity, &body);

        let response = tokio::time::timeout(self.transport.timeout(), request)
            .await
            .map_err(|_| TransportError::Timeout(self.transport.timeout()))??;

        match response.expect_success()? {
            Some(VisitResponse {
                session_id: Some(id),
                ..
            }) if !id.trim().is_empty() => Ok(id),
            _ => Err(TransportError::Status {
                status: 200,
                body: "response carried no sessionId".to_string(),
            }),
        }
    }
}

/// A locally generated id for when the backend is unreachable.
pub fn fallback_session_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(FALLBACK_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}{}-{}", FALLBACK_PREFIX, now_ms(), suffix)
}

/// `true` for ids produced by [`fallback_session_id`].
pub fn is_fallback_id(session_id: &str) -> bool {
    session_id.starts_with(FALLBACK_PREFIX)
}
