/// Worker Pool - bounded concurrency over the job queue
///
/// A fixed number of workers each loop: pop a job id, claim it (atomic
/// `pending -> running`), execute it under the job ceiling, and persist
/// the terminal state. One job per worker at a time, end to end.
///
/// **Failure handling:**
/// - Lost claim: another worker owns the job; do nothing
/// - Infrastructure failure: retry with exponential backoff, then `error`
///   with a generic message (detail stays in the log)
/// - Ceiling breach / unsupported language: `error`, no retry
/// - Program failures are ordinary `done` results
///
/// **Shutdown:**
/// `shutdown()` stops workers from taking new jobs, lets in-flight jobs
/// reach a terminal state, then joins every worker. Jobs are never
/// cancelled because a client stopped polling.

use crate::config::PoolConfig;
use crate::executor::{self, JobFailure};
use crate::sandbox::SandboxExecutor;
use kiln_common::queue::JobQueue;
use kiln_common::runtime::RuntimeRegistry;
use kiln_common::store::{JobStore, StoreError};
use kiln_common::types::{Job, Language, Submission};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const INTERNAL_ERROR_MESSAGE: &str = "internal error while executing job";
pub const CEILING_MESSAGE: &str = "job exceeded its execution time limit";
pub const UNSUPPORTED_MESSAGE: &str = "language is not supported by this worker";

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct PoolDeps {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub sandbox: Arc<dyn SandboxExecutor>,
    pub registry: Arc<RuntimeRegistry>,
}

/// Process-wide worker pool. Build once at startup, shut down explicitly.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(deps: PoolDeps, config: PoolConfig) -> Self {
        let shutdown = CancellationToken::new();
        let config = Arc::new(config);

        info!(
            workers = config.workers,
            languages = ?config.languages,
            max_attempts = config.max_attempts,
            "Starting worker pool"
        );

        let handles = (0..config.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    deps: deps.clone(),
                    config: Arc::clone(&config),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { shutdown, handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop claiming, drain in-flight jobs, join workers.
    pub async fn shutdown(self) {
        info!("Worker pool draining");
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    deps: PoolDeps,
    config: Arc<PoolConfig>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        // Cancellation is only checked between pops: a popped id is always
        // processed, so shutdown never drops a job on the floor.
        while !self.shutdown.is_cancelled() {
            match self
                .deps
                .queue
                .pop(&self.config.languages, self.config.poll_interval)
                .await
            {
                Ok(Some((language, job_id))) => self.process(language, job_id).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "Queue error");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }
        debug!(worker = self.id, "Worker stopped");
    }

    #[instrument(skip(self), fields(worker = self.id))]
    async fn process(&self, language: Language, job_id: Uuid) {
        let Some(job) = self.claim(language, job_id).await else {
            return;
        };

        info!(
            job_id = %job.id,
            language = %job.language,
            source_size = job.source.len(),
            "Claimed job"
        );

        let started = std::time::Instant::now();
        let (submission, attempts) = self.execute_with_retries(&job).await;
        self.persist(&job, submission, attempts).await;

        info!(
            job_id = %job.id,
            attempts,
            execution_ms = started.elapsed().as_millis() as u64,
            "Job finished"
        );
    }

    /// Claim with bounded retries on storage errors. If the store stays
    /// unavailable the id goes back on its own queue rather than being lost.
    async fn claim(&self, language: Language, job_id: Uuid) -> Option<Job> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.deps.store.claim(job_id).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {
                    debug!(job_id = %job_id, "Lost claim race or job not pending");
                    return None;
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(job_id = %job_id, "Queued job has no record");
                    return None;
                }
                Err(e) if attempt < self.config.max_attempts => {
                    warn!(job_id = %job_id, attempt, error = %e, "Claim failed, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Claim failed, requeueing");
                    self.requeue(language, job_id).await;
                    return None;
                }
            }
        }
    }

    async fn requeue(&self, language: Language, job_id: Uuid) {
        if let Err(e) = self.deps.queue.push(language, job_id).await {
            error!(job_id = %job_id, language = %language, error = %e, "Failed to requeue job");
        }
    }

    async fn execute_with_retries(&self, job: &Job) -> (Submission, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = executor::execute_job(
                job,
                &self.deps.registry,
                self.deps.sandbox.as_ref(),
                self.config.output_limit_bytes,
                self.config.job_overhead,
            )
            .await;

            match result {
                Ok(submission) => return (submission, attempt),
                Err(failure) if failure.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        job_id = %job.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Infrastructure failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    error!(job_id = %job.id, attempt, error = %failure, "Job failed");
                    let message = match failure {
                        JobFailure::CeilingExceeded(_) => CEILING_MESSAGE,
                        JobFailure::Unsupported(_) => UNSUPPORTED_MESSAGE,
                        JobFailure::Infrastructure(_) | JobFailure::Inconsistent { .. } => INTERNAL_ERROR_MESSAGE,
                    };
                    return (
                        Submission::Failed {
                            message: message.to_string(),
                        },
                        attempt,
                    );
                }
            }
        }
    }

    /// Write the terminal state; only the claiming worker ever gets here.
    async fn persist(&self, job: &Job, submission: Submission, attempts: u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.deps.store.finish(job.id, submission.clone(), attempts).await {
                Ok(done) => {
                    debug!(job_id = %job.id, status = %done.status, "Result persisted");
                    return;
                }
                Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                    error!(job_id = %job.id, error = %e, "Job record changed under its owner");
                    return;
                }
                Err(e) if attempt < self.config.max_attempts => {
                    warn!(job_id = %job.id, attempt, error = %e, "Failed to persist result, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to persist result");
                    return;
                }
            }
        }
    }
}
