// Worker pool configuration, derived from process settings.
use kiln_common::config::Settings;
use kiln_common::runtime::RuntimeRegistry;
use kiln_common::types::Language;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Fixed number of concurrent workers.
    pub workers: usize,
    /// Queues this pool serves. Order carries no priority.
    pub languages: Vec<Language>,
    /// Upper bound on one blocking pop; also the shutdown latency.
    pub poll_interval: Duration,
    /// Total attempts per job for infrastructure failures.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub job_overhead: Duration,
    pub output_limit_bytes: usize,
}

impl PoolConfig {
    /// Languages come from `WORKER_LANGUAGES`, else everything the
    /// registry enables.
    pub fn from_settings(settings: &Settings, registry: &RuntimeRegistry) -> Self {
        let languages = if settings.worker_languages.is_empty() {
            registry.languages()
        } else {
            settings.worker_languages.clone()
        };

        Self {
            workers: settings.workers,
            languages,
            poll_interval: Duration::from_secs(5),
            max_attempts: settings.max_attempts,
            retry_backoff: settings.retry_backoff,
            max_backoff: Duration::from_secs(30),
            job_overhead: settings.job_overhead,
            output_limit_bytes: settings.output_limit_bytes,
        }
    }

    /// Exponential backoff before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
