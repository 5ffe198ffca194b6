//! Client connection state and the per-connection notification sender.

use std::time::Instant;

use keel_protocol::{HandshakeClientInfo, Principal, RpcNotification};
use tokio::sync::mpsc;

/// Where a connection stands in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Authenticated,
    Rejected,
}

/// Represents a connected client with its authentication state.
#[derive(Debug)]
pub struct ClientConnection {
    /// Unique client ID
    pub id: String,
    /// When the client connected
    pub connected_at: Instant,
    /// Authentication state
    pub auth_state: AuthState,
    /// Principal bound by the handshake
    pub principal: Option<Principal>,
    /// Client info (set after successful handshake)
    pub client_info: Option<HandshakeClientInfo>,
    /// Last time we received any message from this client
    pub last_activity: Instant,
}

impl ClientConnection {
    pub fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            connected_at: now,
            auth_state: AuthState::Pending,
            principal: None,
            client_info: None,
            last_activity: now,
        }
    }

    pub fn authenticate(&mut self, principal: Principal, client_info: Option<HandshakeClientInfo>) {
        self.auth_state = AuthState::Authenticated;
        self.principal = Some(principal);
        self.client_info = client_info;
    }

    pub fn reject(&mut self) {
        self.auth_state = AuthState::Rejected;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("client {0} is gone")]
    Closed(String),
    #[error("outbound queue for client {0} is full")]
    Full(String),
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Pushes notifications into one client's outbound queue.
///
/// Sending never waits: a full or closed queue is reported and the
/// notification is dropped.
#[derive(Debug, Clone)]
pub struct ClientNotifier {
    client_id: String,
    tx: mpsc::Sender<String>,
}

impl ClientNotifier {
    pub fn new(client_id: impl Into<String>, tx: mpsc::Sender<String>) -> Self {
        Self {
            client_id: client_id.into(),
            tx,
        }
    }

    /// A notifier plus the receiving end of its queue.
    pub fn channel(client_id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(client_id, tx), rx)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn notify(&self, notification: &RpcNotification) -> Result<(), NotifyError> {
        let text = serde_json::to_string(notification)?;
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::Full(self.client_id.clone()),
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed(self.client_id.clone()),
        })
    }
}
