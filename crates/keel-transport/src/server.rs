//! WebSocket transport server using Axum.
//!
//! Handles HTTP upgrade to WebSocket, the principal handshake, and hands
//! every authenticated request to the `RequestHandler` on its own task.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use keel_protocol::{
    AuthConfig, AuthErrorCode, AuthRequiredParams, Call, HandlerResult, HandshakeClientInfo,
    HandshakeParams, HandshakeResult, Methods, Notifications, Principal, RequestId, RpcError,
    RpcNotification, RpcResponse,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::client::{ClientConnection, ClientNotifier};

/// Reported in the handshake and the welcome notification.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Trait implemented by the session server.
///
/// The transport opens one connection per authenticated socket, routes each
/// request against it from a spawned task, and closes it when the socket goes
/// away.
pub trait RequestHandler: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// Bind a new connection to `principal`. `notifier` feeds the client's
    /// outbound queue.
    fn open_connection(
        &self,
        client_id: &str,
        principal: Principal,
        notifier: ClientNotifier,
    ) -> impl Future<Output = Result<Self::Connection, RpcError>> + Send;

    /// Handle one JSON-RPC request on `connection`.
    fn handle_request(
        &self,
        connection: &Self::Connection,
        method: &str,
        params: Option<Value>,
    ) -> impl Future<Output = HandlerResult> + Send;

    /// The socket is gone.
    fn close_connection(&self, connection: &Self::Connection) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),
    #[error("failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Token check. Without it any handshake is accepted, but a principal is
    /// still required.
    pub auth: Option<AuthConfig>,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Outbound queue depth per connection
    pub outbound_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            hostname: "127.0.0.1".into(),
            auth: None,
            enable_cors: false,
            max_connections: Some(64),
            outbound_queue: 256,
        }
    }
}

impl TransportConfig {
    fn handshake_timeout(&self) -> Duration {
        let ms = self
            .auth
            .as_ref()
            .map(|a| a.handshake_timeout_ms)
            .unwrap_or_else(|| AuthConfig::default().handshake_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Shared state for the transport server.
struct AppState<H: RequestHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    /// Connected client count (for health check)
    client_count: AtomicUsize,
}

/// The transport server: accepts WebSocket connections and routes messages.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound port
    port: u16,
}

impl TransportServer {
    /// Start the transport server. The handler is shared so the caller can
    /// keep driving it (e.g. for shutdown).
    pub async fn start<H: RequestHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            client_count: AtomicUsize::new(0),
        });

        let mut app = Router::new()
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .with_state(state);
        if config.enable_cors {
            app = app.layer(ServiceBuilder::new().layer(CorsLayer::permissive()));
        }

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!("Keel transport listening on ws://{}:{}/ws", config.hostname, actual_port);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                error!("Transport server failed: {e}");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Keel transport server stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: RequestHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection<H: RequestHandler>(socket: WebSocket, state: Arc<AppState<H>>) {
    state.client_count.fetch_add(1, Ordering::Relaxed);

    let mut client = ClientConnection::new(uuid::Uuid::new_v4().to_string());
    let client_id = client.id.clone();
    info!("Client connected: {client_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single writer: responses and notifications are queued here.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.config.outbound_queue);
    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                debug!("Writer for {writer_id} stopped: {e}");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let timeout = state.config.handshake_timeout();
    let auth_required = RpcNotification::new(
        Notifications::AUTH_REQUIRED,
        Some(json!(AuthRequiredParams {
            server_version: SERVER_VERSION.into(),
            timeout: timeout.as_millis() as u64,
        })),
    );
    if out_tx.send(encode(&auth_required)).await.is_err() {
        error!("Failed to send auth/required to {client_id}");
        state.client_count.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    let auth_deadline = tokio::time::Instant::now() + timeout;
    let mut connection: Option<Arc<H::Connection>> = None;

    loop {
        let authenticated = connection.is_some();
        let auth_sleep = async move {
            if authenticated {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep_until(auth_deadline).await;
            }
        };

        tokio::select! {
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    // tungstenite answers pings itself.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client disconnected: {client_id}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {client_id}: {e}");
                        break;
                    }
                };
                client.touch();

                let conn = match connection.clone() {
                    Some(conn) => conn,
                    None => {
                        match handle_handshake(&text, &state.config) {
                            HandshakeOutcome::Authenticated { id, principal, client_info } => {
                                let notifier = ClientNotifier::new(client_id.clone(), out_tx.clone());
                                match state.handler.open_connection(&client_id, principal.clone(), notifier).await {
                                    Ok(conn) => {
                                        let result = HandshakeResult {
                                            client_id: client_id.clone(),
                                            session_id: principal.session.clone(),
                                            server_version: SERVER_VERSION.into(),
                                        };
                                        let resp = RpcResponse::reply(id, Ok(json!(result)));
                                        let _ = out_tx.send(encode(&resp)).await;
                                        let _ = out_tx.send(encode(&welcome(&client_id))).await;
                                        debug!("Client {client_id} authenticated as {}", principal.user);
                                        client.authenticate(principal, client_info);
                                        connection = Some(Arc::new(conn));
                                    }
                                    Err(e) => {
                                        warn!("Session attach failed for {client_id}: {e}");
                                        let _ = out_tx.send(encode(&RpcResponse::failure(id, e))).await;
                                        break;
                                    }
                                }
                            }
                            HandshakeOutcome::Rejected(response) => {
                                client.reject();
                                let _ = out_tx.send(response).await;
                                warn!("Client auth failed: {client_id}");
                                break;
                            }
                            HandshakeOutcome::NotHandshake(response) => {
                                let _ = out_tx.send(response).await;
                            }
                        }
                        continue;
                    }
                };

                // Hand off; the loop goes straight back to reading.
                let handler = state.handler.clone();
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let response = handle_message(&text, handler.as_ref(), conn.as_ref()).await;
                    if out.send(response).await.is_err() {
                        debug!("Response dropped: client is gone");
                    }
                });
            }

            _ = auth_sleep => {
                warn!("Auth timeout for client {client_id}");
                let err = RpcResponse::failure(
                    None,
                    AuthErrorCode::HandshakeTimeout.error("Authentication timeout"),
                );
                let _ = out_tx.send(encode(&err)).await;
                break;
            }
        }
    }

    if let Some(conn) = connection.take() {
        state.handler.close_connection(&conn).await;
    }
    drop(out_tx);
    // In-flight requests keep their own sender; the writer ends once they finish.
    drop(writer);

    state.client_count.fetch_sub(1, Ordering::Relaxed);
    info!(
        "Client disconnected: {client_id} ({:?}, connected {:?}, total: {})",
        client.auth_state,
        client.connected_at.elapsed(),
        state.client_count.load(Ordering::Relaxed)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Serialize an outbound message. Our own types always encode; the fallback
/// keeps the connection alive if one somehow does not.
fn encode<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        error!("Failed to encode outbound message: {e}");
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal server error"}}"#
            .to_string()
    })
}

fn welcome(client_id: &str) -> RpcNotification {
    RpcNotification::new(
        Notifications::SERVER_CONNECTED,
        Some(json!({
            "clientId": client_id,
            "serverVersion": SERVER_VERSION,
        })),
    )
}

enum HandshakeOutcome {
    Authenticated {
        id: Option<RequestId>,
        principal: Principal,
        client_info: Option<HandshakeClientInfo>,
    },
    Rejected(String),
    NotHandshake(String),
}

fn handle_handshake(text: &str, config: &TransportConfig) -> HandshakeOutcome {
    let call = match Call::parse(text) {
        Ok(call) => call,
        Err(response) => return HandshakeOutcome::NotHandshake(encode(&response)),
    };
    if call.method != Methods::AUTH_HANDSHAKE {
        let err = AuthErrorCode::NotAuthenticated.error("Not authenticated. Send auth/handshake first.");
        return HandshakeOutcome::NotHandshake(encode(&RpcResponse::failure(call.id, err)));
    }

    let params = call
        .params
        .and_then(|v| serde_json::from_value::<HandshakeParams>(v).ok());
    let Some(params) = params else {
        let err = RpcError::validation("auth/handshake requires token and principal");
        return HandshakeOutcome::Rejected(encode(&RpcResponse::failure(call.id, err)));
    };
    if let Err(err) = params.verify(config.auth.as_ref()) {
        return HandshakeOutcome::Rejected(encode(&RpcResponse::failure(call.id, err)));
    }

    HandshakeOutcome::Authenticated {
        id: call.id,
        principal: params
            .principal
            .into_principal(|| uuid::Uuid::new_v4().to_string()),
        client_info: params.client,
    }
}

async fn handle_message<H: RequestHandler>(
    text: &str,
    handler: &H,
    connection: &H::Connection,
) -> String {
    let call = match Call::parse(text) {
        Ok(call) => call,
        Err(response) => return encode(&response),
    };
    let result = handler.handle_request(connection, &call.method, call.params).await;
    encode(&RpcResponse::reply(call.id, result))
}
