/// Job Executor - one attempt at turning a claimed job into a submission
///
/// Glue between the registry, the evaluator and the job-level ceiling. It
/// knows nothing about queues, claims or retries; the pool owns those.

use crate::evaluator::{self, Evaluation};
use crate::sandbox::{SandboxError, SandboxExecutor};
use kiln_common::runtime::{NotSupported, RuntimeRegistry, RuntimeSpec};
use kiln_common::types::{Job, JobInput, Submission};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum JobFailure {
    /// Retryable: the sandbox could not do its job.
    #[error(transparent)]
    Infrastructure(#[from] SandboxError),
    #[error(transparent)]
    Unsupported(#[from] NotSupported),
    #[error("job exceeded its ceiling of {0:?}")]
    CeilingExceeded(Duration),
    #[error("evaluation produced {actual} results for {expected} test cases")]
    Inconsistent { expected: usize, actual: usize },
}

impl JobFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobFailure::Infrastructure(_))
    }
}

/// Hard ceiling for a whole job: compile timeout, every run timeout, plus
/// fixed overhead for container churn.
pub fn job_ceiling(runtime: &RuntimeSpec, runs: usize, overhead: Duration) -> Duration {
    runtime.compile_timeout() + runtime.run_timeout() * runs as u32 + overhead
}

/// Execute one attempt of `job`.
pub async fn execute_job(
    job: &Job,
    registry: &RuntimeRegistry,
    sandbox: &dyn SandboxExecutor,
    output_limit_bytes: usize,
    overhead: Duration,
) -> Result<Submission, JobFailure> {
    let runtime = registry.resolve(job.language)?;
    // Image pulls are infrastructure time, not the program's.
    sandbox.ensure_runtime(runtime).await?;

    let limits = runtime.limits(output_limit_bytes);
    let ceiling = job_ceiling(runtime, job.expected_result_count(), overhead);

    info!(
        job_id = %job.id,
        language = %job.language,
        test_count = job.expected_result_count(),
        ceiling_ms = ceiling.as_millis() as u64,
        "Starting job execution"
    );

    let evaluation = async {
        match &job.input {
            JobInput::Run { stdin } => evaluator::run_free(sandbox, runtime, &job.source, stdin, &limits).await,
            JobInput::Challenge { test_cases, .. } => {
                evaluator::evaluate(sandbox, runtime, &job.source, test_cases, &limits).await
            }
        }
    };

    let evaluation: Evaluation = match tokio::time::timeout(ceiling, evaluation).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(job_id = %job.id, ceiling_ms = ceiling.as_millis() as u64, "Job ceiling exceeded");
            return Err(JobFailure::CeilingExceeded(ceiling));
        }
    };

    // One result per snapshotted case, or exactly one for a free run.
    let expected = job.expected_result_count();
    if evaluation.test_results.len() != expected {
        return Err(JobFailure::Inconsistent {
            expected,
            actual: evaluation.test_results.len(),
        });
    }

    Ok(evaluation.into_submission())
}
