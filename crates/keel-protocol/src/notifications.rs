//! Notification name constants.
//!
//! Notifications are server-to-client messages with no response expected.

/// All Keel notification names.
pub struct Notifications;

impl Notifications {
    // ── Authentication ──────────────────────────────────────────────────
    pub const AUTH_REQUIRED: &str = "auth/required";

    // ── Server lifecycle ────────────────────────────────────────────────
    pub const SERVER_CONNECTED: &str = "server/connected";

    // ── Session ─────────────────────────────────────────────────────────
    /// Best-effort notice sent to a client before its session is torn down.
    pub const SESSION_CLOSED: &str = "session/closed";
}

/// Type alias for notification names.
pub type NotificationName = &'static str;
