//! Broadcast-accept acquisition.
//!
//! ```text
//!  caller ──submit(WAITING)──▶ JobStore
//!    │
//!    ├─register reply id──▶ MessageBus ◀──reply── worker A
//!    ├─publish willAccept─▶   (topic)   ◀──reply── worker B
//!    │                          │
//!    └─wait(budget)◀── AcquisitionResult ◀── first authorized "yes"
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::{AcceptReply, AcceptRequest, MessageBus, WorkerHandle, ACCEPT_TOPIC};
use crate::job::{JobDescriptor, JobStore};
use crate::slot::AcquisitionResult;
use crate::AcquireError;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub user_id: i64,
    pub group_id: i64,
}

/// A job to bind to a processor, with the requester and a deadline.
#[derive(Debug, Clone)]
pub struct AcquisitionRequest {
    pub job: JobDescriptor,
    pub requester: Requester,
    pub deadline: Instant,
}

/// Stand-in deadline for waits too large to add to the clock.
const FOREVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl AcquisitionRequest {
    pub fn new(job: JobDescriptor, requester: Requester, max_wait: Duration) -> Self {
        let now = Instant::now();
        Self {
            job,
            requester,
            deadline: now.checked_add(max_wait).unwrap_or(now + FOREVER),
        }
    }
}

/// Unregisters the per-request reply identity however the wait ends.
struct ReplyGuard<'a> {
    bus: &'a dyn MessageBus,
    reply_to: String,
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        if self.bus.unregister_reply(&self.reply_to) {
            debug!("Released reply identity {}", self.reply_to);
        }
    }
}

pub struct BroadcastAccept {
    bus: Arc<dyn MessageBus>,
    jobs: Arc<dyn JobStore>,
    /// Upper bound on how long any caller waits for replies.
    budget: Duration,
}

impl BroadcastAccept {
    pub fn new(bus: Arc<dyn MessageBus>, jobs: Arc<dyn JobStore>, budget: Duration) -> Self {
        Self { bus, jobs, budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Bind `request.job` to the first authorized processor that accepts it.
    ///
    /// The job is recorded as `Waiting` before anything is published. The
    /// caller waits at most `min(deadline - now, budget)`; nobody answering
    /// yields `Ok(None)`.
    pub async fn acquire(
        &self,
        request: AcquisitionRequest,
    ) -> Result<Option<WorkerHandle>, AcquireError> {
        let AcquisitionRequest {
            job,
            requester,
            deadline,
        } = request;

        self.jobs
            .submit_waiting(&job, requester.user_id, requester.group_id)?;

        let reply_to = format!("acquire.reply.{}", uuid::Uuid::new_v4());
        let result = Arc::new(AcquisitionResult::<WorkerHandle>::new());

        let slot = result.clone();
        let callback_reply_to = reply_to.clone();
        self.bus.register_reply(
            &reply_to,
            Arc::new(move |reply: AcceptReply| {
                if !reply.accepted {
                    debug!("{} declined ({callback_reply_to})", reply.worker.worker_id);
                    return;
                }
                if !is_authorized(&reply, requester) {
                    debug!(
                        "Ignoring {}: owned by user {} (requester {})",
                        reply.worker.worker_id, reply.owner_user_id, requester.user_id
                    );
                    return;
                }
                if !slot.offer(reply.worker.clone()) {
                    debug!("Late acceptance from {} ignored", reply.worker.worker_id);
                }
            }),
        )?;
        let _guard = ReplyGuard {
            bus: self.bus.as_ref(),
            reply_to: reply_to.clone(),
        };

        let reached = self.bus.publish(
            ACCEPT_TOPIC,
            AcceptRequest {
                user_id: requester.user_id,
                group_id: requester.group_id,
                job: job.clone(),
                reply_to,
            },
        )?;

        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(self.budget);
        debug!(
            "Job {} offered to {reached} processor(s); waiting up to {:?}",
            job.id, wait
        );

        let winner = result.wait(wait).await;
        match &winner {
            Some(worker) => info!("Job {} accepted by {}", job.id, worker.worker_id),
            None => info!("No processor accepted job {} within {:?}", job.id, wait),
        }
        Ok(winner)
    }
}

/// Only workers run by the requesting user, or by an administrator, may take
/// the job.
fn is_authorized(reply: &AcceptReply, requester: Requester) -> bool {
    reply.owner_is_admin || reply.owner_user_id == requester.user_id
}
