//! Directory-poll acquisition.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::discovery::{CandidateError, Discovery, ResourceDescriptor, ResourceHandle};
use crate::AcquireError;

/// Longest wait a caller may ask for.
pub const MAX_WAIT: Duration = Duration::from_secs(180);

/// After a transient failure, sleep this fraction of the remaining budget.
const RETRY_DIVISOR: u32 = 10;
const MIN_RETRY: Duration = Duration::from_millis(50);

/// One candidate gets at most this fraction of the remaining budget.
const CALL_DIVISOR: u32 = 4;
const MIN_CALL: Duration = Duration::from_millis(250);

/// Scans discovered candidates until one acquires or the deadline passes.
pub struct DirectoryPoll {
    discovery: Arc<dyn Discovery>,
    max_wait: Duration,
}

impl DirectoryPoll {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self::with_ceiling(discovery, MAX_WAIT)
    }

    /// Like [`new`](Self::new) with a lower wait ceiling. Ceilings above
    /// [`MAX_WAIT`] are clamped to it.
    pub fn with_ceiling(discovery: Arc<dyn Discovery>, max_wait: Duration) -> Self {
        Self {
            discovery,
            max_wait: max_wait.min(MAX_WAIT),
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.max_wait
    }

    /// Acquire `descriptor` on some endpoint of type `descriptor.kind`.
    ///
    /// Never blocks past `now + max_wait`. A `max_wait` above the ceiling is
    /// rejected before any network activity. A candidate that does not answer
    /// within its slice of the budget counts as transiently unavailable.
    pub async fn acquire(
        &self,
        descriptor: &ResourceDescriptor,
        max_wait: Duration,
    ) -> Result<Option<ResourceHandle>, AcquireError> {
        if max_wait > self.max_wait {
            return Err(AcquireError::WaitTooLong {
                requested_secs: max_wait.as_secs(),
                max_secs: self.max_wait.as_secs(),
            });
        }

        let deadline = Instant::now() + max_wait;
        let mut scans = 0u32;

        loop {
            let Some(left) = remaining(deadline) else {
                break;
            };
            scans += 1;

            let candidates = match timeout(left, self.discovery.candidates(&descriptor.kind)).await {
                Ok(Ok(candidates)) => candidates,
                Ok(Err(e)) => {
                    debug!("Discovery for {} failed: {e}", descriptor.kind);
                    Vec::new()
                }
                Err(_) => break,
            };

            for candidate in candidates {
                if remaining(deadline).is_none() {
                    break;
                }
                let outcome = timeout(call_budget(deadline), candidate.acquire(descriptor))
                    .await
                    .unwrap_or(Err(CandidateError::Timeout));
                match outcome {
                    Ok(Some(handle)) => {
                        info!(
                            "Acquired {} on {} after {scans} scan(s)",
                            descriptor.target,
                            candidate.endpoint()
                        );
                        return Ok(Some(handle));
                    }
                    Ok(None) => {
                        debug!("{} declined {}", candidate.endpoint(), descriptor.target);
                    }
                    Err(e) if e.is_transient() => {
                        debug!("{} transiently unavailable: {e}", candidate.endpoint());
                        sleep(backoff(deadline)).await;
                    }
                    Err(e) => {
                        warn!("{} failed to acquire {}: {e}", candidate.endpoint(), descriptor.target);
                    }
                }
            }

            sleep(backoff(deadline)).await;
        }

        debug!(
            "No endpoint of type {} acquired {} within {:?}",
            descriptor.kind, descriptor.target, max_wait
        );
        Ok(None)
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

/// How long one candidate may take to answer.
fn call_budget(deadline: Instant) -> Duration {
    let left = deadline.saturating_duration_since(Instant::now());
    (left / CALL_DIVISOR).max(MIN_CALL).min(left)
}

/// A fraction of what is left, never longer than what is left.
fn backoff(deadline: Instant) -> Duration {
    let left = deadline.saturating_duration_since(Instant::now());
    (left / RETRY_DIVISOR).max(MIN_RETRY).min(left)
}
