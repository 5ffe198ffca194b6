//! Job records and the store that tracks their status.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::AcquireError;

/// A unit of remote work waiting for a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub id: i64,
    /// What the job runs (e.g. "script", "import").
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Waiting,
    Running,
    Finished,
    Error,
    Cancelled,
}

/// Stored state of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job: JobDescriptor,
    pub owner_user_id: i64,
    pub group_id: i64,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for job status. Broadcast-accept writes `Waiting` before it
/// asks anyone, so the job survives even if no processor ever answers.
pub trait JobStore: Send + Sync {
    fn submit_waiting(
        &self,
        job: &JobDescriptor,
        owner_user_id: i64,
        group_id: i64,
    ) -> Result<(), AcquireError>;

    fn set_status(&self, job_id: i64, status: JobStatus) -> Result<(), AcquireError>;

    fn get(&self, job_id: i64) -> Option<JobRecord>;

    fn status(&self, job_id: i64) -> Option<JobStatus> {
        self.get(job_id).map(|r| r.status)
    }
}

/// Process-local job store.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<i64, JobRecord>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobStore for InMemoryJobStore {
    fn submit_waiting(
        &self,
        job: &JobDescriptor,
        owner_user_id: i64,
        group_id: i64,
    ) -> Result<(), AcquireError> {
        let now = Utc::now();
        let mut entry = self.jobs.entry(job.id).or_insert_with(|| JobRecord {
            job: job.clone(),
            owner_user_id,
            group_id,
            status: JobStatus::Waiting,
            submitted_at: now,
            updated_at: now,
        });
        if entry.owner_user_id != owner_user_id {
            return Err(AcquireError::NotOwner {
                job_id: job.id,
                user_id: owner_user_id,
            });
        }
        entry.status = JobStatus::Waiting;
        entry.updated_at = now;
        debug!("Job {} is waiting for a processor", job.id);
        Ok(())
    }

    fn set_status(&self, job_id: i64, status: JobStatus) -> Result<(), AcquireError> {
        let mut entry = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AcquireError::Jobs(format!("unknown job {job_id}")))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    fn get(&self, job_id: i64) -> Option<JobRecord> {
        self.jobs.get(&job_id).map(|r| r.clone())
    }
}
