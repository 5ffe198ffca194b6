//! Per-connection session bound to one principal.
//!
//! A session wraps the registry shared by every attachment of its login
//! session, the interceptor chain its servants are built with and an
//! optional notification channel back to the client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use keel_protocol::{
    CallContext, HandlerResult, Identity, Notifications, Principal, ProxyHandle, RpcError,
    RpcNotification,
};
use keel_transport::ClientNotifier;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::{ServiceCatalog, ServiceKind};
use crate::interceptor::InterceptorChain;
use crate::registry::ServantRegistry;
use crate::servant::{ServantBuilder, ServantRuntime};
use crate::store::SessionStateStore;

/// Live sessions by their own identity.
pub type SessionDirectory = DashMap<Identity, Weak<Session>>;

/// Largest proxy list [`Session::keep_alive`] can answer in one bitmask.
pub const KEEP_ALIVE_MAX: usize = u64::BITS as usize;

/// Shared collaborators every session is attached against.
#[derive(Clone)]
pub struct SessionEnv {
    pub store: Arc<SessionStateStore>,
    pub catalog: Arc<ServiceCatalog>,
    pub runtime: ServantRuntime,
    pub directory: Arc<SessionDirectory>,
}

/// Diagnostic snapshot of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Identity,
    pub client_id: String,
    pub user: String,
    pub session: String,
    pub attachments: usize,
    pub services: Vec<String>,
    pub idle_secs: u64,
}

pub struct Session {
    id: Identity,
    client_id: String,
    principal: Principal,
    registry: Arc<ServantRegistry>,
    chain: Arc<InterceptorChain>,
    env: SessionEnv,
    notifier: Mutex<Option<ClientNotifier>>,
    close_on_destroy: AtomicBool,
    destroyed: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Attach to the shared state of `principal`'s login session.
    pub fn attach(
        principal: Principal,
        client_id: impl Into<String>,
        chain: Arc<InterceptorChain>,
        env: &SessionEnv,
    ) -> Arc<Self> {
        let category = principal.session_key();
        let registry = env.store.attach(&category);
        let id = Identity::new(category, format!("session-{}", Uuid::new_v4()));

        let session = Arc::new(Self {
            id: id.clone(),
            client_id: client_id.into(),
            principal,
            registry,
            chain,
            env: env.clone(),
            notifier: Mutex::new(None),
            close_on_destroy: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        });
        env.directory.insert(id, Arc::downgrade(&session));
        info!(
            "Session {} attached for {} (client {})",
            session.id, session.principal.user, session.client_id
        );
        session
    }

    pub fn id(&self) -> &Identity {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Category of every servant this session owns.
    pub fn category(&self) -> &str {
        self.registry.category()
    }

    pub fn registry(&self) -> &Arc<ServantRegistry> {
        &self.registry
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), RpcError> {
        if self.is_destroyed() {
            return Err(RpcError::resource(format!("Session {} is destroyed", self.id)));
        }
        Ok(())
    }

    fn builder(&self, identity: Identity) -> ServantBuilder<'_> {
        ServantBuilder::new(identity, &self.chain, &self.env.runtime)
    }

    // ── Services ────────────────────────────────────────────────────────

    /// The stateless servant registered as `name`, created on first use.
    pub async fn get_service(&self, name: &str) -> Result<ProxyHandle, RpcError> {
        self.ensure_live()?;
        self.touch();
        let factory = self.env.catalog.factory(name, ServiceKind::Stateless)?;
        let identity = self.registry.identity_of(name);
        let servant = self
            .registry
            .get_or_create(name, || Ok(factory(self.builder(identity))))
            .await?;
        Ok(servant.proxy())
    }

    /// A new stateful servant of `name` under a fresh unique key.
    pub async fn create_service(&self, name: &str) -> Result<ProxyHandle, RpcError> {
        self.ensure_live()?;
        self.touch();
        let factory = self.env.catalog.factory(name, ServiceKind::Stateful)?;
        let key = format!("{name}-{}", Uuid::new_v4());
        let identity = self.registry.identity_of(&key);
        let servant = self
            .registry
            .create(&key, || Ok(factory(self.builder(identity))))
            .await?;
        info!("Stateful servant {} created", servant.identity());
        Ok(servant.proxy())
    }

    /// Run `method` on the servant behind `proxy` through the dispatch pool.
    pub async fn invoke(&self, proxy: &Identity, method: &str, args: Value) -> HandlerResult {
        self.ensure_live()?;
        self.touch();
        if proxy.category != self.category() {
            return Err(RpcError::authorization(format!(
                "{proxy} does not belong to this session"
            )));
        }
        let servant = self
            .registry
            .get(&proxy.name)
            .ok_or_else(|| RpcError::resource(format!("No servant registered as {proxy}")))?;

        let context = CallContext::new(
            Uuid::new_v4().to_string(),
            self.client_id.as_str(),
            self.principal.clone(),
            proxy.clone(),
        );
        self.env
            .runtime
            .bridge
            .invoke_and_wait(servant, method, context, args)
            .await
    }

    // ── Liveness ────────────────────────────────────────────────────────

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    fn is_registered(&self, proxy: &Identity) -> bool {
        proxy.category == self.category() && self.registry.contains(&proxy.name)
    }

    /// Bit `i` is set when `proxies[i]` is no longer registered.
    pub fn keep_alive(&self, proxies: &[Identity]) -> Result<u64, RpcError> {
        if proxies.len() > KEEP_ALIVE_MAX {
            return Err(RpcError::validation(format!(
                "keepAlive accepts at most {KEEP_ALIVE_MAX} proxies, got {}",
                proxies.len()
            )));
        }
        self.touch();
        Ok(proxies
            .iter()
            .enumerate()
            .filter(|(_, proxy)| !self.is_registered(proxy))
            .fold(0u64, |mask, (i, _)| mask | (1 << i)))
    }

    /// True while `proxy` is still registered.
    pub fn keep_alive_single(&self, proxy: &Identity) -> bool {
        self.touch();
        self.is_registered(proxy)
    }

    pub fn active_services(&self) -> Vec<String> {
        self.registry.list_keys()
    }

    // ── Destroy policy ──────────────────────────────────────────────────

    pub fn set_notification_channel(&self, notifier: ClientNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Keep the shared state alive when the last attachment goes away.
    pub fn detach_on_destroy(&self) {
        self.close_on_destroy.store(false, Ordering::SeqCst);
    }

    pub fn close_on_destroy(&self) {
        self.close_on_destroy.store(true, Ordering::SeqCst);
    }

    pub fn closes_on_destroy(&self) -> bool {
        self.close_on_destroy.load(Ordering::SeqCst)
    }

    /// Drop this attachment. The last attachment with the close policy set
    /// tears the shared registry down. A second call does nothing.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Session {} already destroyed", self.id);
            return;
        }
        let close = self.closes_on_destroy();
        if let Some(registry) = self.env.store.release(self.category(), close) {
            self.notify_closed();
            registry.drain().await;
        }
        self.env.directory.remove(&self.id);
        info!("Session {} destroyed (close={close})", self.id);
    }

    /// The client may already be gone; failures are only logged.
    fn notify_closed(&self) {
        let Some(notifier) = self.notifier.lock().clone() else {
            return;
        };
        let notification = RpcNotification::new(
            Notifications::SESSION_CLOSED,
            Some(json!({ "session": self.category(), "id": self.id })),
        );
        if let Err(e) = notifier.notify(&notification) {
            debug!("Close notice for {} not delivered: {e}", self.id);
        }
    }

    pub fn describe(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            user: self.principal.user.clone(),
            session: self.category().to_string(),
            attachments: self.env.store.attachments(self.category()),
            services: self.active_services(),
            idle_secs: self.idle_for().as_secs(),
        }
    }
}
