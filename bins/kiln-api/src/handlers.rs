// HTTP route handlers for the Kiln API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use kiln_common::types::Language;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

use crate::auth::Identity;
use crate::error::{ApiError, FieldError};
use crate::metrics;
use crate::status::{self, JobResponse};
use crate::submission::{self, CreateJobRequest, CreateJobResponse};
use crate::AppState;

/// POST /jobs - Submit a job for execution
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Identity(caller): Identity,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::Validation(vec![FieldError::new("body", rejection.body_text())])
    })?;

    let job_id = submission::create_job(&state, &caller, request).await?;
    Ok((StatusCode::CREATED, Json(CreateJobResponse { job_id })))
}

/// GET /jobs/{job_id} - Query job status and result
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Identity(caller): Identity,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = status::get_job(&state, &caller, &job_id).await?;
    Ok(Json(JobResponse { job }))
}

/// GET /health - Liveness check
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Debug, Serialize)]
pub struct LanguageInfo {
    pub language: Language,
    pub compiled: bool,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_timeout_ms: Option<u64>,
    pub memory_limit_mb: u32,
    pub cpu_limit: f64,
}

#[derive(Debug, Serialize)]
pub struct LanguagesResponse {
    pub languages: Vec<LanguageInfo>,
}

/// GET /languages - Enabled languages and their limits
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Json<LanguagesResponse> {
    let languages = state
        .registry
        .runtimes()
        .map(|runtime| LanguageInfo {
            language: runtime.language,
            compiled: runtime.is_compiled(),
            timeout_ms: runtime.timeout_ms,
            compile_timeout_ms: runtime.compile.as_ref().map(|step| step.timeout_ms),
            memory_limit_mb: runtime.memory_limit_mb,
            cpu_limit: runtime.cpu_limit,
        })
        .collect();
    Json(LanguagesResponse { languages })
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics() -> Response {
    match metrics::render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
