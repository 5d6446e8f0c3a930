// Status API: read-only view of one job.
//
// Reads never mutate the job, so polling a terminal job any number of
// times yields the same bytes.

use crate::error::ApiError;
use crate::metrics::STATUS_READS_TOTAL;
use crate::AppState;
use kiln_common::types::{Caller, JobView};
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: JobView,
}

#[instrument(skip(state), fields(caller = %caller.id))]
pub async fn get_job(state: &AppState, caller: &Caller, job_id: &str) -> Result<JobView, ApiError> {
    let id = Uuid::parse_str(job_id.trim()).map_err(|_| ApiError::BadRequest("invalid job id".to_string()))?;

    let job = state.store.get(id).await?.ok_or(ApiError::NotFound)?;
    if !caller.can_read(&job) {
        return Err(ApiError::Forbidden);
    }

    STATUS_READS_TOTAL.inc();
    debug!(job_id = %id, status = %job.status, "Job status read");
    Ok(job.view())
}
