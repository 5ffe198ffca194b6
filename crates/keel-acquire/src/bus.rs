//! Publish/subscribe bus with point-to-point reply delivery.
//!
//! Topics fan a request out to every subscribed worker. Replies travel back
//! to a named reply identity registered by the requester; a reply to an
//! identity nobody holds any more is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::job::JobDescriptor;

/// Topic on which "will you accept this job" requests are published.
pub const ACCEPT_TOPIC: &str = "processor.willAccept";

const TOPIC_CAPACITY: usize = 256;

/// Address of a worker able to run jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHandle {
    pub worker_id: String,
    pub endpoint: String,
}

/// "Will you accept this job for user U in group G?"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    pub user_id: i64,
    pub group_id: i64,
    pub job: JobDescriptor,
    /// Reply identity the answer must be delivered to.
    pub reply_to: String,
}

/// A worker's answer to an [`AcceptRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptReply {
    pub accepted: bool,
    /// User that owns the answering worker.
    pub owner_user_id: i64,
    #[serde(default)]
    pub owner_is_admin: bool,
    pub worker: WorkerHandle,
}

/// Callback invoked for each reply delivered to a reply identity.
pub type ReplyCallback = Arc<dyn Fn(AcceptReply) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("message bus is shutting down")]
    ShuttingDown,
    #[error("reply identity already registered: {0}")]
    DuplicateReplyIdentity(String),
    #[error("no such reply identity: {0}")]
    UnknownReplyIdentity(String),
}

/// The contract the acquisition protocol needs from a bus.
pub trait MessageBus: Send + Sync {
    /// Publish to every current subscriber of `topic`. Returns how many
    /// subscribers the message reached.
    fn publish(&self, topic: &str, request: AcceptRequest) -> Result<usize, BusError>;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<AcceptRequest>;

    fn register_reply(&self, reply_to: &str, callback: ReplyCallback) -> Result<(), BusError>;

    /// Returns whether the identity was registered.
    fn unregister_reply(&self, reply_to: &str) -> bool;

    fn reply(&self, reply_to: &str, reply: AcceptReply) -> Result<(), BusError>;
}

/// Process-local bus backed by tokio broadcast channels.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<AcceptRequest>>,
    replies: DashMap<String, ReplyCallback>,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live reply identities (leak detection in tests and health).
    pub fn reply_identities(&self) -> usize {
        self.replies.len()
    }

    /// Reject all further publishing and reply registration.
    pub fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.replies.clear();
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn topic(&self, topic: &str) -> broadcast::Sender<AcceptRequest> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, request: AcceptRequest) -> Result<usize, BusError> {
        self.ensure_open()?;
        // No subscribers is not a failure; nobody will answer, that's all.
        let reached = self.topic(topic).send(request).unwrap_or(0);
        debug!("Published on {topic} to {reached} subscriber(s)");
        Ok(reached)
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<AcceptRequest> {
        self.topic(topic).subscribe()
    }

    fn register_reply(&self, reply_to: &str, callback: ReplyCallback) -> Result<(), BusError> {
        self.ensure_open()?;
        match self.replies.entry(reply_to.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BusError::DuplicateReplyIdentity(reply_to.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(callback);
                Ok(())
            }
        }
    }

    fn unregister_reply(&self, reply_to: &str) -> bool {
        self.replies.remove(reply_to).is_some()
    }

    fn reply(&self, reply_to: &str, reply: AcceptReply) -> Result<(), BusError> {
        self.ensure_open()?;
        // Clone the callback out so it never runs under a shard lock.
        let callback = self
            .replies
            .get(reply_to)
            .map(|cb| cb.value().clone())
            .ok_or_else(|| BusError::UnknownReplyIdentity(reply_to.to_string()))?;
        callback(reply);
        Ok(())
    }
}
