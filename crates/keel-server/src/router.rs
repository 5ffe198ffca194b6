//! Keel request router: maps session and servant methods onto the
//! connection's [`Session`].

use std::sync::Arc;

use keel_protocol::{HandlerResult, Identity, Methods, Principal, RpcError};
use keel_transport::{ClientNotifier, RequestHandler};
use parking_lot::RwLock;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::manager::SessionManager;
use crate::session::Session;

/// The Keel server: owns the session manager and routes requests.
pub struct RpcServer {
    manager: SessionManager,
    state: RwLock<ServerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Running,
    Shutdown,
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct KeepAliveParams {
    proxies: Vec<Identity>,
}

#[derive(Deserialize)]
struct KeepAliveSingleParams {
    proxy: Identity,
}

#[derive(Deserialize)]
struct InvokeParams {
    proxy: Identity,
    method: String,
    #[serde(default)]
    args: Value,
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| RpcError::validation(format!("Invalid params: {e}")))
}

impl RpcServer {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            state: RwLock::new(ServerState::Uninitialized),
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    pub fn initialize(&self) {
        *self.state.write() = ServerState::Running;
        info!("Keel server initialized");
    }

    /// Refuse new work and tear every session down.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == ServerState::Shutdown {
                return;
            }
            *state = ServerState::Shutdown;
        }
        info!("Shutting down Keel server...");
        self.manager.shutdown_all().await;
        info!("Keel server shutdown complete");
    }

    fn check_state(&self) -> Result<(), RpcError> {
        match self.state() {
            ServerState::Shutdown => Err(RpcError::shutting_down()),
            ServerState::Uninitialized => Err(RpcError::not_initialized()),
            ServerState::Running => Ok(()),
        }
    }

    async fn route(&self, session: &Session, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            Methods::SESSION_GET_SERVICE => {
                let p: NameParams = parse(params)?;
                Ok(json!(session.get_service(&p.name).await?))
            }
            Methods::SESSION_CREATE_SERVICE => {
                let p: NameParams = parse(params)?;
                Ok(json!(session.create_service(&p.name).await?))
            }
            Methods::SESSION_KEEP_ALIVE => {
                let p: KeepAliveParams = parse(params)?;
                Ok(json!({ "missing": session.keep_alive(&p.proxies)? }))
            }
            Methods::SESSION_KEEP_ALIVE_SINGLE => {
                let p: KeepAliveSingleParams = parse(params)?;
                Ok(json!({ "alive": session.keep_alive_single(&p.proxy) }))
            }
            Methods::SESSION_ACTIVE_SERVICES => Ok(json!({ "services": session.active_services() })),
            Methods::SESSION_DETACH_ON_DESTROY => {
                session.detach_on_destroy();
                Ok(json!({ "success": true }))
            }
            Methods::SESSION_CLOSE_ON_DESTROY => {
                session.close_on_destroy();
                Ok(json!({ "success": true }))
            }
            Methods::SESSION_DESTROY => {
                session.destroy().await;
                Ok(json!({ "success": true }))
            }
            Methods::SERVANT_INVOKE => {
                let p: InvokeParams = parse(params)?;
                session.invoke(&p.proxy, &p.method, p.args).await
            }
            Methods::SERVER_SESSIONS => {
                Ok(json!({ "sessions": self.manager.describe_for(session.principal()) }))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

impl RequestHandler for RpcServer {
    type Connection = Arc<Session>;

    async fn open_connection(
        &self,
        client_id: &str,
        principal: Principal,
        notifier: ClientNotifier,
    ) -> Result<Arc<Session>, RpcError> {
        self.check_state()?;
        let session = self.manager.attach(principal, client_id);
        session.set_notification_channel(notifier);
        Ok(session)
    }

    async fn handle_request(
        &self,
        session: &Arc<Session>,
        method: &str,
        params: Option<Value>,
    ) -> HandlerResult {
        self.check_state()?;
        debug!("Session {} → {method}", session.id());
        self.route(session, method, params).await
    }

    async fn close_connection(&self, session: &Arc<Session>) {
        session.destroy().await;
    }
}
