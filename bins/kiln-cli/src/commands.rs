// CLI commands for talking to a Kiln deployment
use anyhow::{bail, Context, Result};
use kiln_common::runtime::RuntimeRegistry;
use kiln_common::types::{JobView, Language, Submission, TestResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What a submission runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunInput {
    Stdin(String),
    Challenge(String),
}

#[derive(Debug, Serialize)]
struct CreateJobBody<'a> {
    language: &'a str,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreateJobReply {
    job_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct JobReply {
    job: JobView,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorReply {
    #[serde(default)]
    error: String,
    #[serde(default)]
    errors: Vec<FieldErrorReply>,
}

#[derive(Debug, Deserialize)]
struct FieldErrorReply {
    field: String,
    message: String,
}

/// Thin HTTP client for the Kiln API.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    user: Option<String>,
    role: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, user: Option<String>, role: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            role,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let Some(user) = &self.user else {
            bail!("No caller identity: pass --user or set KILN_USER");
        };
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-kiln-user", user);
        if let Some(role) = &self.role {
            builder = builder.header("x-kiln-role", role);
        }
        Ok(builder)
    }

    async fn create_job(&self, body: &CreateJobBody<'_>) -> Result<Uuid> {
        let response = self
            .request(reqwest::Method::POST, "/jobs")?
            .json(body)
            .send()
            .await
            .context("Failed to reach the Kiln API")?;
        let reply: CreateJobReply = decode(response).await?;
        Ok(reply.job_id)
    }

    async fn get_job(&self, job_id: &str) -> Result<JobView> {
        let response = self
            .request(reqwest::Method::GET, &format!("/jobs/{}", job_id))?
            .send()
            .await
            .context("Failed to reach the Kiln API")?;
        let reply: JobReply = decode(response).await?;
        Ok(reply.job)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("Unexpected response from the Kiln API");
    }

    let reply: ErrorReply = response.json().await.unwrap_or_default();
    let mut message = format!("API returned {}", status);
    if !reply.error.is_empty() {
        message.push_str(&format!(": {}", reply.error));
    }
    for field in reply.errors {
        message.push_str(&format!("\n  - {}: {}", field.field, field.message));
    }
    bail!(message)
}

/// Work out the run input from the mutually exclusive flags. No flags at
/// all is a free run with empty stdin.
pub fn resolve_input(stdin: Option<String>, stdin_file: Option<&Path>, challenge: Option<String>) -> Result<RunInput> {
    match (stdin, stdin_file, challenge) {
        (None, None, Some(id)) => Ok(RunInput::Challenge(id)),
        (Some(text), None, None) => Ok(RunInput::Stdin(text)),
        (None, Some(path), None) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read stdin file {}", path.display()))?;
            Ok(RunInput::Stdin(text))
        }
        (None, None, None) => Ok(RunInput::Stdin(String::new())),
        _ => bail!("Use only one of --stdin, --stdin-file, --challenge"),
    }
}

/// Submit a source file; returns the job id without waiting.
pub async fn submit(client: &ApiClient, language: &str, file: &Path, input: RunInput) -> Result<Uuid> {
    if Language::from_str(language).is_none() {
        bail!("Unknown language '{}'", language);
    }
    let source = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let body = CreateJobBody {
        language,
        source: &source,
        stdin: match &input {
            RunInput::Stdin(text) => Some(text.as_str()),
            RunInput::Challenge(_) => None,
        },
        challenge_id: match &input {
            RunInput::Challenge(id) => Some(id.as_str()),
            RunInput::Stdin(_) => None,
        },
    };

    println!("🚀 Submitting {} ({} bytes)...", file.display(), source.len());
    let job_id = client.create_job(&body).await?;
    println!("✅ Job queued: {}", job_id);
    Ok(job_id)
}

pub async fn status(client: &ApiClient, job_id: &str) -> Result<()> {
    let job = client.get_job(job_id).await?;
    print!("{}", render_job(&job));
    Ok(())
}

/// Poll interval, never faster than once a second.
pub fn poll_interval(interval_secs: u64) -> Duration {
    Duration::from_secs(interval_secs.max(1))
}

/// Bounded polling. Giving up here does not stop the job.
pub async fn wait(client: &ApiClient, job_id: &str, interval_secs: u64, max_attempts: u32) -> Result<()> {
    let interval = poll_interval(interval_secs);
    for attempt in 1..=max_attempts.max(1) {
        let job = client.get_job(job_id).await?;
        if job.status.is_terminal() {
            print!("{}", render_job(&job));
            return Ok(());
        }
        println!("⏳ [{}/{}] {}", attempt, max_attempts.max(1), job.status);
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    println!("\n⏳ Job {} is still processing.", job_id);
    println!("💡 Check again later with: kiln-cli status {}", job_id);
    Ok(())
}

pub fn list_languages(config: &Path) -> Result<()> {
    let registry = RuntimeRegistry::load_or_builtin(config)
        .with_context(|| format!("Failed to load {}", config.display()))?;

    println!("📋 Configured Languages:\n");
    println!(
        "{:<8} {:<26} {:<10} {:<12} {:<10}",
        "NAME", "IMAGE", "COMPILED", "TIMEOUT", "MEMORY"
    );
    println!("{}", "─".repeat(70));
    for runtime in registry.runtimes() {
        println!(
            "{:<8} {:<26} {:<10} {:<12} {} MB",
            runtime.language.as_str(),
            runtime.image,
            if runtime.is_compiled() { "yes" } else { "no" },
            format!("{} ms", runtime.timeout_ms),
            runtime.memory_limit_mb
        );
    }
    println!("\n✅ Total: {} language(s)", registry.languages().len());
    Ok(())
}

fn render_result(index: usize, result: &TestResult) -> String {
    let mark = if result.passed { "✅" } else { "❌" };
    let time = result
        .time
        .map(|t| format!("{:.3}s", t))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!("  {} #{} {}", mark, index + 1, time);
    if result.timed_out {
        line.push_str(" (timed out)");
    }
    if result.hidden {
        line.push_str(" (hidden)");
    }
    if result.truncated {
        line.push_str(" (output truncated)");
    }
    line.push('\n');
    if let Some(output) = result.output.as_deref().filter(|o| !o.is_empty()) {
        line.push_str(&format!("     stdout: {}\n", output.trim_end()));
    }
    if let Some(stderr) = result.stderr.as_deref() {
        line.push_str(&format!("     stderr: {}\n", stderr.trim_end()));
    }
    line
}

/// Human-readable job summary.
pub fn render_job(job: &JobView) -> String {
    let mut out = format!("Job {} [{}] {}\n", job.id, job.language, job.status);
    match &job.submission {
        None => out.push_str("  (no result yet)\n"),
        Some(Submission::Failed { message }) => out.push_str(&format!("  ⚠️  {}\n", message)),
        Some(Submission::Evaluated {
            passed,
            test_results,
            compile_error,
        }) => {
            if let Some(diagnostic) = compile_error {
                out.push_str(&format!("  🔨 compilation failed:\n{}\n", diagnostic.trim_end()));
            }
            for (idx, result) in test_results.iter().enumerate() {
                out.push_str(&render_result(idx, result));
            }
            let verdict = if *passed { "✅ passed" } else { "❌ failed" };
            out.push_str(&format!("  {}\n", verdict));
        }
    }
    out
}
