// Job Store: durable record of job identity, status and result.
//
// The store is the only arbiter of ownership: `claim` is an atomic
// pending -> running compare-and-set, and `finish` an atomic
// running -> terminal one. Everything else is a plain read or insert.

use crate::types::{Job, JobStatus, Submission};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to (de)serialize job record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {id} already exists")]
    AlreadyExists { id: Uuid },
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job. It must be `pending`.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Atomically move `pending -> running`.
    ///
    /// Returns the claimed job, or `None` when another worker got there
    /// first (or the job is otherwise not pending). Losing is not an error.
    async fn claim(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Atomically move `running -> done|error` and record the submission.
    /// Fails with `Conflict` if the job is not running; terminal records
    /// are never overwritten.
    async fn finish(&self, id: Uuid, submission: Submission, attempts: u32) -> Result<Job, StoreError>;
}

/// In-process store used by tests and single-node development.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        if job.status != JobStatus::Pending {
            return Err(StoreError::Conflict {
                id: job.id,
                expected: JobStatus::Pending,
                actual: job.status,
            });
        }
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists { id: job.id });
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.transition(JobStatus::Running)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Some(job.clone()))
    }

    async fn finish(&self, id: Uuid, submission: Submission, attempts: u32) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Err(StoreError::Conflict {
                id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        job.attempts = attempts;
        job.finish(submission)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(job.clone())
    }
}
