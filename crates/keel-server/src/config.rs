//! Server configuration.

use std::time::Duration;

/// Tunables for the session runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of dispatch workers.
    pub pool_size: usize,
    /// Submissions that may wait for a free worker before callers block.
    pub queue_depth: usize,
    /// A session with no keep-alive or call for this long is reaped.
    pub keep_alive_window: Duration,
    /// How long broadcast-accept waits for an authorized reply.
    pub accept_budget: Duration,
    /// Longest wait a caller may request from an acquisition.
    pub max_acquire_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            queue_depth: 256,
            keep_alive_window: Duration::from_secs(300),
            accept_budget: Duration::from_secs(30),
            max_acquire_wait: keel_acquire::MAX_WAIT,
        }
    }
}
