use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use crate::configs::client_config::ClientConfig;
use crate::retrieve::transport::RequestIdentity;

/// Point-in-time copy of the session fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub tenant_id: String,
    pub backend_url: String,
    pub storyfragment_id: String,
    pub ready: bool,
}

impl SessionSnapshot {
    /// Headers for a request made on behalf of this snapshot.
    pub fn identity(&self) -> RequestIdentity {
        RequestIdentity {
            tenant_id: self.tenant_id.clone(),
            session_id: self.session_id.clone(),
            storyfragment_id: (!self.storyfragment_id.is_empty())
                .then(|| self.storyfragment_id.clone()),
        }
    }
}

struct Inner {
    state: RwLock<SessionSnapshot>,
    ready_tx: watch::Sender<bool>,
}

/// Shared, cloneable handle on the page's session.
///
/// `session_id` is written exactly once, by [`SessionContext::mark_ready`],
/// which also fires the readiness signal. Waiters registered before or after
/// that moment each resolve once.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl SessionContext {
    pub fn new(tenant_id: &str, backend_url: &str, storyfragment_id: &str) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(SessionSnapshot {
                    session_id: None,
                    tenant_id: tenant_id.to_string(),
                    backend_url: backend_url.trim_end_matches('/').to_string(),
                    storyfragment_id: storyfragment_id.to_string(),
                    ready: false,
                }),
                ready_tx,
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.tenant_id(),
            config.backend_url(),
            config.storyfragment_id(),
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionSnapshot> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionSnapshot> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready_tx.borrow()
    }

    /// Records the resolved session id and fires readiness.
    ///
    /// Returns `false` (and changes nothing) if the session was already ready.
    pub fn mark_ready(&self, session_id: &str) -> bool {
        {
            let mut state = self.write();
            if state.ready {
                log::warn!(
                    "Session already ready as {:?}; ignoring {}",
                    state.session_id,
                    session_id
                );
                return false;
            }
            state.session_id = Some(session_id.to_string());
            state.ready = true;
        }
        self.inner.ready_tx.send_replace(true);
        log::info!("Session ready: {}", session_id);
        true
    }

    /// Soft navigation: only the storyfragment changes.
    pub fn set_storyfragment(&self, storyfragment_id: &str) {
        self.write().storyfragment_id = storyfragment_id.to_string();
    }

    /// Suspends until the session is ready, then returns a snapshot.
    pub async fn wait_ready(&self) -> SessionSnapshot {
        let mut rx = self.inner.ready_tx.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|ready| *ready).await;
        self.snapshot()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SessionContext").field(&*self.read()).finish()
    }
}
