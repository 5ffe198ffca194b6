//! Remote worker acquisition.
//!
//! Two interchangeable ways of binding a job or resource request to one of
//! several independently registered workers:
//!
//! - [`DirectoryPoll`] asks a [`Discovery`] service for candidate endpoints
//!   and tries each in turn until one accepts or the deadline passes.
//! - [`BroadcastAccept`] records the job as `Waiting`, broadcasts a
//!   "will you accept" message on a [`MessageBus`] and takes the first
//!   authorized affirmative reply.
//!
//! Finding nothing before the deadline is a normal `None`, never an error.

pub mod broadcast;
pub mod bus;
pub mod discovery;
pub mod job;
pub mod poll;
pub mod processor;
pub mod slot;

use keel_protocol::RpcError;

pub use broadcast::{AcquisitionRequest, BroadcastAccept, Requester};
pub use bus::{
    AcceptReply, AcceptRequest, BusError, InMemoryBus, MessageBus, ReplyCallback, WorkerHandle,
    ACCEPT_TOPIC,
};
pub use discovery::{
    Candidate, CandidateError, Discovery, ResourceDescriptor, ResourceHandle, StaticDiscovery,
};
pub use job::{InMemoryJobStore, JobDescriptor, JobRecord, JobStatus, JobStore};
pub use poll::{DirectoryPoll, MAX_WAIT};
pub use processor::LocalProcessor;
pub use slot::AcquisitionResult;

/// Errors raised by the acquisition protocols. Timeouts are not among them.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("requested wait of {requested_secs}s exceeds the {max_secs}s ceiling")]
    WaitTooLong { requested_secs: u64, max_secs: u64 },
    #[error("message bus failure: {0}")]
    Bus(#[from] BusError),
    #[error("job {job_id} does not belong to user {user_id}")]
    NotOwner { job_id: i64, user_id: i64 },
    #[error("job store failure: {0}")]
    Jobs(String),
}

impl From<AcquireError> for RpcError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::WaitTooLong { .. } => RpcError::validation(err.to_string()),
            AcquireError::NotOwner { .. } => RpcError::authorization(err.to_string()),
            AcquireError::Bus(BusError::ShuttingDown) => RpcError::shutting_down(),
            AcquireError::Bus(_) | AcquireError::Jobs(_) => RpcError::resource(err.to_string()),
        }
    }
}
