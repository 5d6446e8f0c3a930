// In-memory sandbox for tests.
//
// The first non-empty line of the source is a directive:
//   echo              stdout = stdin
//   upper             stdout = uppercased stdin
//   print <text>      stdout = text
//   loop              times out at the run limit
//   crash             exits 1 with a traceback on stderr
//   syntax-error      compile fails (compiled languages) or crashes
//   infra-fail <n>    first n prepares fail as infrastructure errors, then echo
//   sleep <ms>        sleeps, then echo; ignores the run limit
// Anything else behaves like `echo`.
//
// `ensure_runtime` stands in for an image pull: it can be slowed down or
// made to fail a number of times.

use crate::sandbox::{ExecutionResult, Prepared, Program, SandboxError, SandboxExecutor};
use async_trait::async_trait;
use kiln_common::runtime::{ExecutionLimits, RuntimeSpec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct FakeSandbox {
    prepares: AtomicUsize,
    runs: AtomicUsize,
    infra_failures: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    stdin_log: Mutex<Vec<String>>,
    pulls: AtomicUsize,
    pull_delay: Duration,
    failed_pulls: usize,
}

enum Directive {
    Echo,
    Upper,
    Print(String),
    Loop,
    Crash,
    SyntaxError,
    InfraFail(usize),
    Sleep(u64),
}

fn directive(source: &str) -> Directive {
    let line = source.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match head {
        "upper" => Directive::Upper,
        "print" => Directive::Print(rest.to_string()),
        "loop" => Directive::Loop,
        "crash" => Directive::Crash,
        "syntax-error" => Directive::SyntaxError,
        "infra-fail" => Directive::InfraFail(rest.trim().parse().unwrap_or(1)),
        "sleep" => Directive::Sleep(rest.trim().parse().unwrap_or(0)),
        _ => Directive::Echo,
    }
}

fn finished(stdout: String, duration_ms: u64) -> ExecutionResult {
    ExecutionResult {
        stdout,
        exit_code: Some(0),
        duration_ms,
        ..Default::default()
    }
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    /// The first `n` runtime preparations fail.
    pub fn with_failed_pulls(mut self, n: usize) -> Self {
        self.failed_pulls = n;
        self
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn prepares(&self) -> usize {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Stdin of every run, in execution order.
    pub fn stdin_log(&self) -> Vec<String> {
        self.stdin_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxExecutor for FakeSandbox {
    async fn ensure_runtime(&self, runtime: &RuntimeSpec) -> Result<(), SandboxError> {
        let attempt = self.pulls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.pull_delay).await;
        if attempt < self.failed_pulls {
            return Err(SandboxError::Image {
                image: runtime.image.clone(),
                reason: "fake registry unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn prepare(&self, runtime: &RuntimeSpec, source: &str) -> Result<Prepared, SandboxError> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        match directive(source) {
            Directive::InfraFail(n) if self.infra_failures.fetch_add(1, Ordering::SeqCst) < n => {
                Err(SandboxError::Spawn("fake daemon unavailable".to_string()))
            }
            Directive::SyntaxError if runtime.is_compiled() => Ok(Prepared::CompileFailed(ExecutionResult {
                stderr: format!("{}:1:1: error: expected ';' before '}}' token", runtime.source_file()),
                exit_code: Some(1),
                duration_ms: 120,
                crashed: true,
                ..Default::default()
            })),
            _ => Ok(Prepared::Ready(Program::new(runtime.clone(), source, None))),
        }
    }

    async fn run(
        &self,
        program: &Program,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.stdin_log.lock().unwrap().push(stdin.to_string());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let result = match directive(program.source()) {
            Directive::Echo | Directive::InfraFail(_) => finished(stdin.to_string(), 12),
            Directive::Upper => finished(stdin.to_uppercase(), 12),
            Directive::Print(text) => finished(format!("{text}\n"), 8),
            Directive::Loop => ExecutionResult {
                duration_ms: limits.timeout.as_millis() as u64,
                timed_out: true,
                ..Default::default()
            },
            Directive::Crash | Directive::SyntaxError => ExecutionResult {
                stderr: "Traceback (most recent call last):\nRuntimeError: boom\n".to_string(),
                exit_code: Some(1),
                duration_ms: 30,
                crashed: true,
                ..Default::default()
            },
            Directive::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                finished(stdin.to_string(), ms)
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }
}
