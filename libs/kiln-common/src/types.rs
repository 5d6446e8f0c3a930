use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Languages the engine can execute.
///
/// Closed on purpose: adding a variant is a reviewed change, and the
/// registry (`config/languages.json`) supplies the commands and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Python,
    Ruby,
    Lua,
    Java,
    Rust,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::C,
        Language::Cpp,
        Language::Python,
        Language::Ruby,
        Language::Lua,
        Language::Java,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Python => "python",
            Language::Ruby => "ruby",
            Language::Lua => "lua",
            Language::Java => "java",
            Language::Rust => "rust",
        }
    }

    /// Parse a language identifier, case-insensitively.
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Language::ALL.into_iter().find(|lang| lang.as_str() == s)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle: `pending -> running -> {done, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
}

/// What a job runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    /// Free-form run with explicit stdin.
    Run { stdin: String },
    /// Challenge run; `test_cases` is the snapshot taken at creation.
    Challenge {
        challenge_id: String,
        test_cases: Vec<TestCase>,
    },
}

/// Outcome of one test case as reported to the caller.
///
/// For hidden cases only `passed`, `time` and `timed_out` carry data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    /// Wall-clock seconds; `None` when the run never started.
    pub time: Option<f64>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

/// Terminal payload of a job. Written exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Submission {
    Evaluated {
        passed: bool,
        test_results: Vec<TestResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compile_error: Option<String>,
    },
    Failed {
        message: String,
    },
}

impl Submission {
    /// Terminal status this submission implies.
    pub fn status(&self) -> JobStatus {
        match self {
            Submission::Evaluated { .. } => JobStatus::Done,
            Submission::Failed { .. } => JobStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub language: Language,
    pub source: String,
    pub input: JobInput,
    pub status: JobStatus,
    #[serde(default)]
    pub submission: Option<Submission>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(owner_id: impl Into<String>, language: Language, source: impl Into<String>, input: JobInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            language,
            source: source.into(),
            input,
            status: JobStatus::Pending,
            submission: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn challenge_id(&self) -> Option<&str> {
        match &self.input {
            JobInput::Challenge { challenge_id, .. } => Some(challenge_id),
            JobInput::Run { .. } => None,
        }
    }

    /// Number of results an evaluated submission of this job must carry.
    pub fn expected_result_count(&self) -> usize {
        match &self.input {
            JobInput::Challenge { test_cases, .. } => test_cases.len(),
            JobInput::Run { .. } => 1,
        }
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError { from: self.status, to: next });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Record the terminal submission; only legal from `running`.
    pub fn finish(&mut self, submission: Submission) -> Result<(), TransitionError> {
        self.transition(submission.status())?;
        self.submission = Some(submission);
        Ok(())
    }

    /// Caller-facing projection.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            language: self.language,
            status: self.status,
            submission: if self.status.is_terminal() {
                self.submission.clone()
            } else {
                None
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        // Keep updated_at strictly advancing even on coarse clocks.
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub language: Language,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<Submission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Identity handed over by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: Role::User }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can_read(&self, job: &Job) -> bool {
        self.is_admin() || job.owner_id == self.id
    }
}
