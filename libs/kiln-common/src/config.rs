// Process settings, read once from the environment at startup.

use crate::types::Language;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
    #[error("unknown language '{0}' in WORKER_LANGUAGES")]
    UnknownLanguage(String),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub bind_addr: String,
    pub languages_path: PathBuf,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub output_limit_bytes: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub job_overhead: Duration,
    /// TTL applied to terminal jobs; `None` keeps them forever.
    pub result_ttl: Option<Duration>,
    pub scratch_dir: PathBuf,
    /// Languages this worker serves; empty means all.
    pub worker_languages: Vec<Language>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            languages_path: PathBuf::from("config/languages.json"),
            max_source_bytes: 64 * 1024,
            max_stdin_bytes: 1024 * 1024,
            output_limit_bytes: 64 * 1024,
            workers: 4,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            job_overhead: Duration::from_secs(10),
            result_ttl: Some(Duration::from_secs(86_400)),
            scratch_dir: std::env::temp_dir(),
            worker_languages: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(url) = lookup("REDIS_URL") {
            settings.redis_url = url;
        }
        if let Some(addr) = lookup("KILN_BIND") {
            settings.bind_addr = addr;
        }
        if let Some(path) = lookup("KILN_LANGUAGES") {
            settings.languages_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("KILN_SCRATCH_DIR") {
            settings.scratch_dir = PathBuf::from(dir);
        }

        settings.max_source_bytes = parse_or(&lookup, "KILN_MAX_SOURCE_BYTES", settings.max_source_bytes)?;
        settings.max_stdin_bytes = parse_or(&lookup, "KILN_MAX_STDIN_BYTES", settings.max_stdin_bytes)?;
        settings.output_limit_bytes = parse_or(&lookup, "KILN_OUTPUT_LIMIT_BYTES", settings.output_limit_bytes)?;
        settings.workers = parse_or(&lookup, "KILN_WORKERS", settings.workers)?;
        settings.max_attempts = parse_or(&lookup, "KILN_MAX_ATTEMPTS", settings.max_attempts)?;

        let backoff_ms: u64 = parse_or(&lookup, "KILN_RETRY_BACKOFF_MS", 500)?;
        settings.retry_backoff = Duration::from_millis(backoff_ms);
        let overhead_ms: u64 = parse_or(&lookup, "KILN_JOB_OVERHEAD_MS", 10_000)?;
        settings.job_overhead = Duration::from_millis(overhead_ms);
        let ttl_secs: u64 = parse_or(&lookup, "KILN_RESULT_TTL_SECS", 86_400)?;
        settings.result_ttl = (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs));

        if settings.workers == 0 {
            return Err(SettingsError::Invalid { name: "KILN_WORKERS", value: "0".to_string() });
        }
        if settings.max_attempts == 0 {
            return Err(SettingsError::Invalid { name: "KILN_MAX_ATTEMPTS", value: "0".to_string() });
        }

        if let Some(list) = lookup("WORKER_LANGUAGES") {
            settings.worker_languages = parse_languages(&list)?;
        }

        Ok(settings)
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| SettingsError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Parse a comma-separated language list such as `python,cpp`.
pub fn parse_languages(list: &str) -> Result<Vec<Language>, SettingsError> {
    let mut languages = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let lang = Language::from_str(name).ok_or_else(|| SettingsError::UnknownLanguage(name.to_string()))?;
        if !languages.contains(&lang) {
            languages.push(lang);
        }
    }
    Ok(languages)
}
