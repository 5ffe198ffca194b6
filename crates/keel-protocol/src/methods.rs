//! Method name constants: every JSON-RPC method grouped by namespace.
//!
//! Each constant is the exact string sent over the wire as the `method` field
//! of a JSON-RPC request.

/// All Keel method names, grouped by namespace.
pub struct Methods;

impl Methods {
    // ── Auth ────────────────────────────────────────────────────────────
    pub const AUTH_HANDSHAKE: &str = "auth/handshake";

    // ── Session ─────────────────────────────────────────────────────────
    pub const SESSION_GET_SERVICE: &str = "session/getService";
    pub const SESSION_CREATE_SERVICE: &str = "session/createService";
    pub const SESSION_KEEP_ALIVE: &str = "session/keepAlive";
    pub const SESSION_KEEP_ALIVE_SINGLE: &str = "session/keepAliveSingle";
    pub const SESSION_ACTIVE_SERVICES: &str = "session/activeServices";
    pub const SESSION_DETACH_ON_DESTROY: &str = "session/detachOnDestroy";
    pub const SESSION_CLOSE_ON_DESTROY: &str = "session/closeOnDestroy";
    pub const SESSION_DESTROY: &str = "session/destroy";

    // ── Servant ─────────────────────────────────────────────────────────
    pub const SERVANT_INVOKE: &str = "servant/invoke";

    // ── Server ──────────────────────────────────────────────────────────
    pub const SERVER_SESSIONS: &str = "server/sessions";
}

/// Lifecycle methods every stateful servant answers in addition to its own
/// interface.
pub struct LifecycleMethods;

impl LifecycleMethods {
    pub const ACTIVATE: &str = "activate";
    pub const PASSIVATE: &str = "passivate";
    pub const CLOSE: &str = "close";
    pub const GET_CURRENT_CONTEXT: &str = "getCurrentContext";

    pub fn is_lifecycle(method: &str) -> bool {
        matches!(
            method,
            Self::ACTIVATE | Self::PASSIVATE | Self::CLOSE | Self::GET_CURRENT_CONTEXT
        )
    }
}

/// Returns true if the given string is a known top-level Keel method.
pub fn is_known_method(method: &str) -> bool {
    matches!(
        method.split('/').next(),
        Some("auth") | Some("session") | Some("servant") | Some("server")
    )
}

/// Type alias: the method name is always a `&str` at the protocol level.
pub type MethodName = &'static str;
