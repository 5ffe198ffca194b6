//! Keel protocol types.
//!
//! JSON-RPC 2.0 compatible types for the Keel session runtime. This crate is
//! the single source of truth for the error taxonomy, servant identities,
//! principals, method names and notification names.

pub mod auth;
pub mod context;
pub mod error;
pub mod identity;
pub mod jsonrpc;
pub mod methods;
pub mod notifications;

pub use auth::{
    AuthConfig, AuthErrorCode, AuthRequiredParams, HandshakeClientInfo, HandshakeParams,
    HandshakeResult, PrincipalClaim,
};
pub use context::CallContext;
pub use error::{RpcError, RpcErrorCode};
pub use identity::{Identity, IdentityParseError, Principal, ProxyHandle};
pub use jsonrpc::{Call, HandlerResult, Outcome, RequestId, RpcNotification, RpcResponse, Version};
pub use methods::{LifecycleMethods, MethodName, Methods};
pub use notifications::{NotificationName, Notifications};
