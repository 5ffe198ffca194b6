//! In-process processor that answers accept requests over the bus.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{AcceptReply, AcceptRequest, MessageBus, WorkerHandle, ACCEPT_TOPIC};

type AcceptPolicy = Arc<dyn Fn(&AcceptRequest) -> bool + Send + Sync>;

/// A worker living in this process. Useful for single-node deployments and
/// for exercising the protocol end to end.
pub struct LocalProcessor {
    handle: WorkerHandle,
    owner_user_id: i64,
    owner_is_admin: bool,
    policy: AcceptPolicy,
}

impl LocalProcessor {
    /// A processor run by `owner_user_id` that accepts everything.
    pub fn new(handle: WorkerHandle, owner_user_id: i64) -> Self {
        Self {
            handle,
            owner_user_id,
            owner_is_admin: false,
            policy: Arc::new(|_| true),
        }
    }

    pub fn admin(mut self) -> Self {
        self.owner_is_admin = true;
        self
    }

    pub fn with_policy(
        mut self,
        policy: impl Fn(&AcceptRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Subscribe now and answer requests on a background task until the
    /// topic closes. The subscription exists before this returns, so a
    /// publish right after cannot be missed.
    pub fn spawn(self, bus: Arc<dyn MessageBus>) -> JoinHandle<()> {
        let mut rx = bus.subscribe(ACCEPT_TOPIC);
        info!("Processor {} listening on {ACCEPT_TOPIC}", self.handle.worker_id);

        tokio::spawn(async move {
            loop {
                let request = match rx.recv().await {
                    Ok(request) => request,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Processor {} skipped {skipped} request(s)", self.handle.worker_id);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let accepted = (self.policy)(&request);
                let reply = AcceptReply {
                    accepted,
                    owner_user_id: self.owner_user_id,
                    owner_is_admin: self.owner_is_admin,
                    worker: self.handle.clone(),
                };
                if let Err(e) = bus.reply(&request.reply_to, reply) {
                    // The requester stopped waiting; nothing to do.
                    debug!("Processor {} reply dropped: {e}", self.handle.worker_id);
                }
            }
            debug!("Processor {} stopped", self.handle.worker_id);
        })
    }
}
