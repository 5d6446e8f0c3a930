/// Test Evaluator - runs a job's test cases and judges the outputs
///
/// **Core Responsibility:**
/// Prepare the program once, feed each test case's input through the
/// sandbox in order, and compare normalised outputs.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or Redis; talks to `SandboxExecutor`
/// - Compiles at most once per job; the artifact is reused for every case
/// - A failing or timed-out case never stops the remaining cases
/// - Infrastructure errors abort the whole evaluation (the pool retries)
/// - Hidden cases never carry input, expected output, stdout or stderr
///
/// **Normalization Rules:**
/// - Trailing whitespace on each line: ignored
/// - Trailing blank lines / final newline: ignored
/// - `\r\n` vs `\n`: ignored
/// - Leading whitespace, inner whitespace, case: significant

use crate::sandbox::{ExecutionResult, Prepared, SandboxError, SandboxExecutor};
use kiln_common::runtime::{ExecutionLimits, RuntimeSpec};
use kiln_common::types::{Submission, TestCase, TestResult};
use tracing::{debug, instrument};

/// Aggregated outcome of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    pub test_results: Vec<TestResult>,
    pub compile_error: Option<String>,
}

impl Evaluation {
    fn from_results(test_results: Vec<TestResult>, compile_error: Option<String>) -> Self {
        Self {
            passed: test_results.iter().all(|r| r.passed),
            test_results,
            compile_error,
        }
    }

    pub fn into_submission(self) -> Submission {
        Submission::Evaluated {
            passed: self.passed,
            test_results: self.test_results,
            compile_error: self.compile_error,
        }
    }
}

/// Normalize output string for comparison
pub fn normalize_output(output: &str) -> String {
    let lines: Vec<&str> = output.lines().map(str::trim_end).collect();
    let end = lines
        .iter()
        .rposition(|line| !line.is_empty())
        .map_or(0, |idx| idx + 1);
    lines[..end].join("\n")
}

pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Judge one execution against one test case, applying hidden-case redaction.
pub fn judge(case: &TestCase, execution: &ExecutionResult) -> TestResult {
    let passed = execution.succeeded() && outputs_match(&execution.stdout, &case.expected_output);
    let visible = !case.is_hidden;

    TestResult {
        passed,
        time: Some(execution.time_secs()),
        timed_out: execution.timed_out,
        hidden: case.is_hidden,
        output: visible.then(|| execution.stdout.clone()),
        stderr: visible.then(|| execution.stderr.clone()).filter(|s| !s.is_empty()),
        input: visible.then(|| case.input.clone()),
        expected_output: visible.then(|| case.expected_output.clone()),
        truncated: visible && execution.truncated(),
    }
}

fn compile_diagnostic(result: &ExecutionResult) -> String {
    let mut message = if result.stderr.trim().is_empty() {
        result.stdout.clone()
    } else {
        result.stderr.clone()
    };
    if result.timed_out {
        if !message.is_empty() && !message.ends_with('\n') {
            message.push('\n');
        }
        message.push_str("[compilation timed out]");
    }
    message
}

fn compile_failure(test_cases: &[TestCase], result: &ExecutionResult) -> Evaluation {
    let test_results = test_cases
        .iter()
        .map(|case| {
            let visible = !case.is_hidden;
            TestResult {
                passed: false,
                time: None,
                timed_out: false,
                hidden: case.is_hidden,
                output: visible.then(String::new),
                stderr: None,
                input: visible.then(|| case.input.clone()),
                expected_output: visible.then(|| case.expected_output.clone()),
                truncated: false,
            }
        })
        .collect();
    Evaluation::from_results(test_results, Some(compile_diagnostic(result)))
}

/// Evaluate `source` against `test_cases`, in order.
///
/// An empty list is a pass and does not touch the sandbox at all.
#[instrument(skip_all, fields(language = %runtime.language, test_count = test_cases.len()))]
pub async fn evaluate(
    sandbox: &dyn SandboxExecutor,
    runtime: &RuntimeSpec,
    source: &str,
    test_cases: &[TestCase],
    limits: &ExecutionLimits,
) -> Result<Evaluation, SandboxError> {
    if test_cases.is_empty() {
        return Ok(Evaluation::from_results(Vec::new(), None));
    }

    let program = match sandbox.prepare(runtime, source).await? {
        Prepared::Ready(program) => program,
        Prepared::CompileFailed(result) => {
            debug!("Compilation failed; all tests marked as failed");
            return Ok(compile_failure(test_cases, &result));
        }
    };

    let mut test_results = Vec::with_capacity(test_cases.len());
    for (idx, case) in test_cases.iter().enumerate() {
        let execution = sandbox.run(&program, &case.input, limits).await?;
        let result = judge(case, &execution);
        debug!(
            test_num = idx + 1,
            passed = result.passed,
            timed_out = execution.timed_out,
            execution_ms = execution.duration_ms,
            "Test result"
        );
        test_results.push(result);
    }

    Ok(Evaluation::from_results(test_results, None))
}

/// Free-form run: one visible result that passes iff the program exits 0
/// within its limit. There is no expected output to compare against.
#[instrument(skip_all, fields(language = %runtime.language))]
pub async fn run_free(
    sandbox: &dyn SandboxExecutor,
    runtime: &RuntimeSpec,
    source: &str,
    stdin: &str,
    limits: &ExecutionLimits,
) -> Result<Evaluation, SandboxError> {
    let program = match sandbox.prepare(runtime, source).await? {
        Prepared::Ready(program) => program,
        Prepared::CompileFailed(result) => {
            let failed = TestResult {
                passed: false,
                time: None,
                timed_out: false,
                hidden: false,
                output: Some(String::new()),
                stderr: None,
                input: Some(stdin.to_string()),
                expected_output: None,
                truncated: false,
            };
            return Ok(Evaluation::from_results(vec![failed], Some(compile_diagnostic(&result))));
        }
    };

    let execution = sandbox.run(&program, stdin, limits).await?;
    let result = TestResult {
        passed: execution.succeeded(),
        time: Some(execution.time_secs()),
        timed_out: execution.timed_out,
        hidden: false,
        output: Some(execution.stdout.clone()),
        stderr: Some(execution.stderr.clone()).filter(|s| !s.is_empty()),
        input: Some(stdin.to_string()),
        expected_output: None,
        truncated: execution.truncated(),
    };
    Ok(Evaluation::from_results(vec![result], None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeSandbox;
    use kiln_common::runtime::RuntimeRegistry;
    use kiln_common::types::Language;

    fn case(input: &str, expected: &str, hidden: bool) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: expected.to_string(),
            is_hidden: hidden,
        }
    }

    fn runtime(lang: Language) -> RuntimeSpec {
        RuntimeRegistry::builtin().resolve(lang).unwrap().clone()
    }

    fn limits(lang: Language) -> ExecutionLimits {
        runtime(lang).limits(64 * 1024)
    }

    fn output(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            duration_ms: 42,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello"), "hello");
        assert_eq!(normalize_output("hello\n"), "hello");
        assert_eq!(normalize_output("hello  \t\n\n\n"), "hello");
        assert_eq!(normalize_output("a  \nb\r\nc\r\n"), "a\nb\nc");
        assert_eq!(normalize_output("  hello"), "  hello");
        assert_eq!(normalize_output(""), "");
        assert_eq!(normalize_output("   \n\n"), "");
        assert_eq!(normalize_output("a\n\nb\n"), "a\n\nb");
    }

    #[test]
    fn test_leading_whitespace_and_case_matter() {
        assert!(!outputs_match(" 42", "42"));
        assert!(!outputs_match("Hello", "hello"));
        assert!(outputs_match("line1\nline2\n", "line1\nline2"));
    }

    #[test]
    fn test_judge_visible_case() {
        let result = judge(&case("5", "120", false), &output("120\n"));
        assert!(result.passed);
        assert_eq!(result.time, Some(0.042));
        assert_eq!(result.output.as_deref(), Some("120\n"));
        assert_eq!(result.input.as_deref(), Some("5"));
        assert_eq!(result.expected_output.as_deref(), Some("120"));
        assert!(result.stderr.is_none());
    }

    #[test]
    fn test_judge_hidden_case_redacts_everything_but_verdict() {
        let mut execution = output("wrong");
        execution.stderr = "debug: secret input was 7".to_string();
        execution.stdout_truncated = true;
        let result = judge(&case("7", "49", true), &execution);
        assert!(!result.passed);
        assert!(result.hidden);
        assert!(result.time.is_some());
        assert!(result.output.is_none());
        assert!(result.stderr.is_none());
        assert!(result.input.is_none());
        assert!(result.expected_output.is_none());
        assert!(!result.truncated);
    }

    #[test]
    fn test_judge_crash_with_correct_output_fails() {
        let execution = ExecutionResult {
            stdout: "120".to_string(),
            exit_code: Some(1),
            crashed: true,
            ..Default::default()
        };
        assert!(!judge(&case("5", "120", false), &execution).passed);
    }

    #[tokio::test]
    async fn test_empty_test_list_passes_without_sandbox() {
        let sandbox = FakeSandbox::new();
        let evaluation = evaluate(&sandbox, &runtime(Language::Cpp), "syntax-error", &[], &limits(Language::Cpp))
            .await
            .unwrap();
        assert!(evaluation.passed);
        assert!(evaluation.test_results.is_empty());
        assert_eq!(sandbox.prepares(), 0);
        assert_eq!(sandbox.runs(), 0);
    }

    #[tokio::test]
    async fn test_compiles_once_and_runs_in_order() {
        let sandbox = FakeSandbox::new();
        let cases = vec![case("a", "a", false), case("b", "b", true), case("c", "c", false)];
        let evaluation = evaluate(&sandbox, &runtime(Language::Cpp), "echo", &cases, &limits(Language::Cpp))
            .await
            .unwrap();
        assert!(evaluation.passed);
        assert_eq!(evaluation.test_results.len(), 3);
        assert_eq!(sandbox.prepares(), 1);
        assert_eq!(sandbox.stdin_log(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_going_and_ands_verdicts() {
        let sandbox = FakeSandbox::new();
        let cases = vec![case("x", "X", false), case("y", "nope", false), case("z", "Z", false)];
        let evaluation = evaluate(&sandbox, &runtime(Language::Python), "upper", &cases, &limits(Language::Python))
            .await
            .unwrap();
        let verdicts: Vec<bool> = evaluation.test_results.iter().map(|r| r.passed).collect();
        assert_eq!(verdicts, vec![true, false, true]);
        assert!(!evaluation.passed);
    }

    #[tokio::test]
    async fn test_compile_failure_fails_every_case() {
        let sandbox = FakeSandbox::new();
        let cases = vec![case("1", "1", false), case("2", "2", true)];
        let evaluation = evaluate(&sandbox, &runtime(Language::Cpp), "syntax-error", &cases, &limits(Language::Cpp))
            .await
            .unwrap();
        assert!(!evaluation.passed);
        assert_eq!(evaluation.test_results.len(), 2);
        assert!(evaluation.test_results.iter().all(|r| !r.passed));
        assert_eq!(evaluation.test_results[0].output.as_deref(), Some(""));
        assert!(evaluation.test_results[1].output.is_none());
        assert!(evaluation.compile_error.unwrap().contains("error: expected ';'"));
        assert_eq!(sandbox.runs(), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failing_result() {
        let sandbox = FakeSandbox::new();
        let cases = vec![case("", "never", false)];
        let evaluation = evaluate(&sandbox, &runtime(Language::Python), "loop", &cases, &limits(Language::Python))
            .await
            .unwrap();
        let result = &evaluation.test_results[0];
        assert!(!result.passed);
        assert!(result.timed_out);
        assert_eq!(result.time, Some(5.0));
    }

    #[tokio::test]
    async fn test_infrastructure_error_propagates() {
        let sandbox = FakeSandbox::new();
        let cases = vec![case("1", "1", false)];
        let err = evaluate(&sandbox, &runtime(Language::Python), "infra-fail 1", &cases, &limits(Language::Python))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_run_free_reports_output() {
        let sandbox = FakeSandbox::new();
        let evaluation = run_free(&sandbox, &runtime(Language::Ruby), "upper", "shout", &limits(Language::Ruby))
            .await
            .unwrap();
        assert!(evaluation.passed);
        let result = &evaluation.test_results[0];
        assert_eq!(result.output.as_deref(), Some("SHOUT"));
        assert_eq!(result.input.as_deref(), Some("shout"));
        assert!(result.expected_output.is_none());
    }

    #[tokio::test]
    async fn test_run_free_crash_fails() {
        let sandbox = FakeSandbox::new();
        let evaluation = run_free(&sandbox, &runtime(Language::Python), "crash", "", &limits(Language::Python))
            .await
            .unwrap();
        assert!(!evaluation.passed);
        assert!(evaluation.test_results[0].stderr.as_deref().unwrap().contains("RuntimeError"));
    }

    #[tokio::test]
    async fn test_run_free_compile_failure() {
        let sandbox = FakeSandbox::new();
        let evaluation = run_free(&sandbox, &runtime(Language::C), "syntax-error", "", &limits(Language::C))
            .await
            .unwrap();
        assert!(!evaluation.passed);
        assert!(evaluation.compile_error.is_some());
        assert_eq!(evaluation.test_results.len(), 1);
    }

    #[test]
    fn test_compile_diagnostic_timeout_note() {
        let result = ExecutionResult {
            stderr: "partial".to_string(),
            timed_out: true,
            ..Default::default()
        };
        assert_eq!(compile_diagnostic(&result), "partial\n[compilation timed out]");
    }
}
