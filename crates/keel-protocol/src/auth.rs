//! The principal handshake that opens every connection.
//!
//! On connect the server announces `auth/required` with its handshake
//! timeout. The first request must be `auth/handshake`, carrying the shared
//! token and the principal the connection acts for. The reply names the client
//! id and the login session the connection joined.

use serde::{Deserialize, Serialize};

use crate::error::{RpcError, RpcErrorCode};
use crate::identity::Principal;

/// Shared-secret settings. Without one every handshake is accepted.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: String,
    pub handshake_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            handshake_timeout_ms: 10_000,
        }
    }
}

/// Handshake failures, numbered after the generic authorization error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorCode {
    /// A request arrived before the handshake.
    NotAuthenticated = -32011,
    InvalidToken = -32012,
    HandshakeTimeout = -32013,
}

impl AuthErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn error(self, message: impl Into<String>) -> RpcError {
        RpcError::new(RpcErrorCode::Custom(self.code()), message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeClientInfo {
    /// Client kind, e.g. "keel-cli".
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Principal as claimed by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalClaim {
    pub user: String,
    pub user_id: i64,
    pub group: String,
    pub group_id: i64,
    #[serde(default)]
    pub admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl PrincipalClaim {
    /// Accept the claim. A claim without a session name gets `fresh()`, so the
    /// attachment shares nothing with anyone.
    pub fn into_principal(self, fresh: impl FnOnce() -> String) -> Principal {
        Principal {
            user: self.user,
            user_id: self.user_id,
            group: self.group,
            group_id: self.group_id,
            admin: self.admin,
            session: self.session.unwrap_or_else(fresh),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeParams {
    pub token: String,
    pub principal: PrincipalClaim,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<HandshakeClientInfo>,
}

impl HandshakeParams {
    /// Check the token against `auth`, if the server has one configured.
    pub fn verify(&self, auth: Option<&AuthConfig>) -> Result<(), RpcError> {
        match auth {
            Some(auth) if auth.token != self.token => {
                Err(AuthErrorCode::InvalidToken.error("Invalid authentication token"))
            }
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequiredParams {
    pub server_version: String,
    /// Milliseconds before an unauthenticated connection is dropped.
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    pub client_id: String,
    /// Login session name; reconnecting with it rejoins the same servants.
    pub session_id: String,
    pub server_version: String,
}
