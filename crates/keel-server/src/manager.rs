//! Session manager: builds sessions and owns the process-wide runtime.

use std::sync::Arc;
use std::time::Duration;

use keel_protocol::Principal;
use tracing::info;

use crate::catalog::ServiceCatalog;
use crate::config::ServerConfig;
use crate::dispatch::DispatchBridge;
use crate::events::EventBus;
use crate::interceptor::InterceptorChain;
use crate::servant::ServantRuntime;
use crate::session::{Session, SessionDirectory, SessionEnv, SessionInfo};
use crate::store::SessionStateStore;

pub struct SessionManager {
    env: SessionEnv,
    chain: Arc<InterceptorChain>,
    config: ServerConfig,
}

impl SessionManager {
    /// Start the dispatch pool and build an empty session directory.
    pub fn new(config: ServerConfig, catalog: ServiceCatalog) -> Self {
        let bridge = Arc::new(DispatchBridge::new(config.pool_size, config.queue_depth));
        let events = Arc::new(EventBus::new());
        let env = SessionEnv {
            store: Arc::new(SessionStateStore::new(events.clone())),
            catalog: Arc::new(catalog),
            runtime: ServantRuntime::new(bridge, events),
            directory: Arc::new(SessionDirectory::new()),
        };
        Self {
            env,
            chain: Arc::new(InterceptorChain::standard()),
            config,
        }
    }

    /// Replace the chain new sessions are attached with.
    pub fn with_chain(mut self, chain: InterceptorChain) -> Self {
        self.chain = Arc::new(chain);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    pub fn runtime(&self) -> &ServantRuntime {
        &self.env.runtime
    }

    pub fn store(&self) -> &Arc<SessionStateStore> {
        &self.env.store
    }

    pub fn attach(&self, principal: Principal, client_id: &str) -> Arc<Session> {
        Session::attach(principal, client_id, Arc::clone(&self.chain), &self.env)
    }

    /// Attach with a chain other than the default.
    pub fn attach_with(
        &self,
        principal: Principal,
        client_id: &str,
        chain: InterceptorChain,
    ) -> Arc<Session> {
        Session::attach(principal, client_id, Arc::new(chain), &self.env)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .env
            .directory
            .iter()
            .filter_map(|e| e.value().upgrade())
            .collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Sessions visible to `viewer`: administrators see every session, anyone
    /// else only the attachments sharing their own login session.
    pub fn describe_for(&self, viewer: &Principal) -> Vec<SessionInfo> {
        let own = viewer.session_key();
        self.sessions()
            .iter()
            .filter(|s| viewer.admin || s.category() == own)
            .map(|s| s.describe())
            .collect()
    }

    /// Destroy sessions nobody has touched for `window`. Returns how many.
    pub async fn reap_idle(&self, window: Duration) -> usize {
        let stale: Vec<_> = self
            .sessions()
            .into_iter()
            .filter(|s| s.idle_for() > window)
            .collect();
        for session in &stale {
            info!("Reaping idle session {}", session.id());
            session.destroy().await;
        }
        stale.len()
    }

    /// Destroy every session, drain every remaining registry, then stop the
    /// event bus and the dispatch pool.
    pub async fn shutdown_all(&self) {
        for session in self.sessions() {
            session.destroy().await;
        }
        for registry in self.env.store.take_all() {
            registry.drain().await;
        }
        self.env.directory.clear();
        self.env.runtime.events.shut_down();
        self.env.runtime.bridge.shutdown();
        info!("All sessions shut down");
    }
}
