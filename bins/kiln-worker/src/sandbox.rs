/// Sandbox Executor - capability boundary for untrusted code
///
/// Everything that touches a process or container goes through
/// [`SandboxExecutor`]. The worker pool and the evaluator only see this
/// trait; production wires in [`crate::engine::DockerEngine`], tests wire in
/// the in-memory fake.
///
/// **Error split:**
/// - `Err(SandboxError)` means the sandbox itself failed (cannot spawn,
///   disk full, daemon gone, output stream lost). These are retried by
///   the pool.
/// - Nonzero exit, timeout, crash, failed compilation are *results*
///   (`Ok(ExecutionResult)` / `Prepared::CompileFailed`) and never retried.

use async_trait::async_trait;
use kiln_common::runtime::{ExecutionLimits, RuntimeSpec};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Raw outcome of one sandboxed process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// Nonzero exit or abnormal termination (not counting timeouts).
    pub crashed: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Exited 0 within its time limit.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.crashed && self.exit_code == Some(0)
    }

    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    pub fn time_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn sandbox: {0}")]
    Spawn(String),
    #[error("container runtime error: {0}")]
    Docker(String),
    #[error("image '{image}' unavailable: {reason}")]
    Image { image: String, reason: String },
}

/// A job's source in runnable form: compiled artifact or copied source,
/// plus the build directory that owns them. Dropping it removes the
/// directory.
#[derive(Debug)]
pub struct Program {
    runtime: RuntimeSpec,
    source: Arc<str>,
    build_dir: Option<TempDir>,
}

impl Program {
    pub fn new(runtime: RuntimeSpec, source: &str, build_dir: Option<TempDir>) -> Self {
        Self {
            runtime,
            source: Arc::from(source),
            build_dir,
        }
    }

    pub fn runtime(&self) -> &RuntimeSpec {
        &self.runtime
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn build_dir(&self) -> Option<&Path> {
        self.build_dir.as_ref().map(|dir| dir.path())
    }
}

#[derive(Debug)]
pub enum Prepared {
    Ready(Program),
    /// The compile step exited nonzero or timed out.
    CompileFailed(ExecutionResult),
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Make the runtime's environment available (e.g. pull its image).
    /// Called before a job's time budget starts; failures are
    /// infrastructure errors.
    async fn ensure_runtime(&self, _runtime: &RuntimeSpec) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Materialise `source` and run the compile step, if any, exactly once.
    async fn prepare(&self, runtime: &RuntimeSpec, source: &str) -> Result<Prepared, SandboxError>;

    /// Run a prepared program once in a fresh scratch directory.
    async fn run(
        &self,
        program: &Program,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, SandboxError>;

    /// One-shot compile-and-run. A failed compile short-circuits into the
    /// returned result without invoking the run step.
    async fn execute(
        &self,
        runtime: &RuntimeSpec,
        source: &str,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        match self.prepare(runtime, source).await? {
            Prepared::Ready(program) => self.run(&program, stdin, limits).await,
            Prepared::CompileFailed(result) => Ok(result),
        }
    }
}

/// Byte-capped capture buffer. Truncation is recorded, never silent.
#[derive(Debug)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Lossy UTF-8 view; a multi-byte char cut by the cap becomes U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
