/// Submission API - validate, persist `pending`, enqueue
///
/// **Validation (all failures reported together):**
/// - `language`: known and enabled in the runtime registry
/// - `source`: non-empty, at most `max_source_bytes`
/// - exactly one of `stdin` / `challenge_id`
/// - `stdin`: at most `max_stdin_bytes`
/// - `challenge_id`: must exist; the caller must be allowed to see it
///
/// Challenge test cases are snapshotted into the job here, so later edits
/// to the challenge never affect a job already accepted. The call returns
/// as soon as the job is queued.

use crate::error::{ApiError, FieldError};
use crate::metrics::{REJECTIONS_TOTAL, SUBMISSIONS_TOTAL};
use crate::AppState;
use kiln_common::types::{Caller, Job, JobInput, Language};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    /// Kept as text so an unknown language is a field error, not a body error.
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub challenge_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
}

#[instrument(skip(state, request), fields(caller = %caller.id, language = %request.language))]
pub async fn create_job(state: &AppState, caller: &Caller, request: CreateJobRequest) -> Result<Uuid, ApiError> {
    let mut errors = Vec::new();
    let limits = &state.settings;

    let language = match Language::from_str(&request.language) {
        Some(lang) if state.registry.is_enabled(lang) => Some(lang),
        Some(lang) => {
            errors.push(FieldError::new("language", format!("language '{}' is not supported", lang)));
            None
        }
        None => {
            errors.push(FieldError::new(
                "language",
                format!("unknown language '{}'", request.language.trim()),
            ));
            None
        }
    };

    if request.source.trim().is_empty() {
        errors.push(FieldError::new("source", "source must not be empty"));
    } else if request.source.len() > limits.max_source_bytes {
        errors.push(FieldError::new(
            "source",
            format!("source exceeds {} bytes", limits.max_source_bytes),
        ));
    }

    let input = match (request.stdin, request.challenge_id) {
        (Some(_), Some(_)) => {
            errors.push(FieldError::new("challenge_id", "provide either stdin or challenge_id, not both"));
            None
        }
        (None, None) => {
            errors.push(FieldError::new("stdin", "one of stdin or challenge_id is required"));
            None
        }
        (Some(stdin), None) => {
            if stdin.len() > limits.max_stdin_bytes {
                errors.push(FieldError::new(
                    "stdin",
                    format!("stdin exceeds {} bytes", limits.max_stdin_bytes),
                ));
            }
            Some(JobInput::Run { stdin })
        }
        (None, Some(challenge_id)) => match state.challenges.get(&challenge_id).await? {
            None => {
                errors.push(FieldError::new(
                    "challenge_id",
                    format!("challenge '{}' does not exist", challenge_id),
                ));
                None
            }
            Some(challenge) if !challenge.accessible_by(caller) => None,
            Some(challenge) => Some(JobInput::Challenge {
                challenge_id,
                test_cases: challenge.test_cases,
            }),
        },
    };

    if !errors.is_empty() {
        REJECTIONS_TOTAL.with_label_values(&["validation"]).inc();
        info!(error_count = errors.len(), "Submission rejected");
        return Err(ApiError::Validation(errors));
    }
    let (Some(language), Some(input)) = (language, input) else {
        // Only an inaccessible challenge leaves the input unset without a field error.
        REJECTIONS_TOTAL.with_label_values(&["forbidden"]).inc();
        info!("Submission refused: challenge not accessible");
        return Err(ApiError::Forbidden);
    };

    let job = Job::new(caller.id.clone(), language, request.source, input);
    state.store.insert(&job).await?;
    if let Err(e) = state.queue.push(language, job.id).await {
        error!(job_id = %job.id, error = %e, "Job persisted but could not be queued");
        return Err(e.into());
    }

    SUBMISSIONS_TOTAL.with_label_values(&[language.as_str()]).inc();
    info!(
        job_id = %job.id,
        language = %language,
        test_cases = job.expected_result_count(),
        source_size = job.source.len(),
        "Job queued"
    );

    Ok(job.id)
}
