// End-to-end pool tests over the in-memory store, queue and fake sandbox.

use crate::config::PoolConfig;
use crate::fake::FakeSandbox;
use crate::pool::{PoolDeps, WorkerPool, CEILING_MESSAGE, INTERNAL_ERROR_MESSAGE, UNSUPPORTED_MESSAGE};
use async_trait::async_trait;
use kiln_common::queue::{JobQueue, MemoryJobQueue};
use kiln_common::runtime::RuntimeRegistry;
use kiln_common::store::{JobStore, MemoryJobStore, StoreError};
use kiln_common::types::{Job, JobInput, JobStatus, Language, Submission, TestCase};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Harness {
    store: Arc<MemoryJobStore>,
    queue: Arc<MemoryJobQueue>,
    sandbox: Arc<FakeSandbox>,
    pool: WorkerPool,
}

fn test_config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        languages: Language::ALL.to_vec(),
        poll_interval: Duration::from_millis(20),
        max_attempts: 3,
        retry_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        job_overhead: Duration::from_secs(10),
        output_limit_bytes: 64 * 1024,
    }
}

impl Harness {
    fn start(workers: usize) -> Self {
        Self::with(RuntimeRegistry::builtin(), test_config(workers))
    }

    fn with(registry: RuntimeRegistry, config: PoolConfig) -> Self {
        Self::assemble(
            registry,
            config,
            FakeSandbox::new(),
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryJobQueue::new()),
        )
    }

    /// Start a pool over existing state, e.g. a queue with a backlog.
    fn assemble(
        registry: RuntimeRegistry,
        config: PoolConfig,
        sandbox: FakeSandbox,
        store: Arc<MemoryJobStore>,
        queue: Arc<MemoryJobQueue>,
    ) -> Self {
        let sandbox = Arc::new(sandbox);
        let deps = PoolDeps {
            store: store.clone(),
            queue: queue.clone(),
            sandbox: sandbox.clone(),
            registry: Arc::new(registry),
        };
        let pool = WorkerPool::start(deps, config);
        Self {
            store,
            queue,
            sandbox,
            pool,
        }
    }

    async fn submit(&self, job: Job) -> Uuid {
        self.store.insert(&job).await.unwrap();
        self.queue.push(job.language, job.id).await.unwrap();
        job.id
    }

    async fn wait_terminal(&self, id: Uuid) -> Job {
        for _ in 0..500 {
            let job = self.store.get(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    async fn wait_status(&self, id: Uuid, status: JobStatus) {
        for _ in 0..500 {
            if self.store.get(id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never became {status}");
    }
}

fn run_job(language: Language, source: &str, stdin: &str) -> Job {
    Job::new("alice", language, source, JobInput::Run { stdin: stdin.into() })
}

fn challenge_job(language: Language, source: &str, cases: Vec<TestCase>) -> Job {
    Job::new(
        "alice",
        language,
        source,
        JobInput::Challenge {
            challenge_id: "sum".into(),
            test_cases: cases,
        },
    )
}

/// Python with a 20ms run limit and 20ms overhead: a 40ms job ceiling.
fn tight_python() -> (RuntimeRegistry, PoolConfig) {
    let registry = RuntimeRegistry::from_json(
        r#"{"languages":[{"language":"python","image":"python:3.12-slim","extension":"py",
            "run":{"command":["python3","{source}"]},"timeout_ms":20,"memory_limit_mb":64}]}"#,
    )
    .unwrap();
    let config = PoolConfig {
        job_overhead: Duration::from_millis(20),
        ..test_config(1)
    };
    (registry, config)
}

/// Store whose claims always hit a backend outage.
struct ClaimOutage(MemoryJobStore);

#[async_trait]
impl JobStore for ClaimOutage {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.0.insert(job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.0.get(id).await
    }

    async fn claim(&self, _id: Uuid) -> Result<Option<Job>, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    async fn finish(&self, id: Uuid, submission: Submission, attempts: u32) -> Result<Job, StoreError> {
        self.0.finish(id, submission, attempts).await
    }
}

fn case(input: &str, expected: &str, hidden: bool) -> TestCase {
    TestCase {
        input: input.into(),
        expected_output: expected.into(),
        is_hidden: hidden,
    }
}

fn evaluated(job: &Job) -> (bool, &[kiln_common::types::TestResult], Option<&str>) {
    match job.submission.as_ref() {
        Some(Submission::Evaluated {
            passed,
            test_results,
            compile_error,
        }) => (*passed, test_results, compile_error.as_deref()),
        other => panic!("expected evaluated submission, got {other:?}"),
    }
}

fn failure_message(job: &Job) -> &str {
    match job.submission.as_ref() {
        Some(Submission::Failed { message }) => message,
        other => panic!("expected failed submission, got {other:?}"),
    }
}

#[tokio::test]
async fn test_python_echo_run_passes() {
    let h = Harness::start(2);
    let id = h.submit(run_job(Language::Python, "echo", "hi\n")).await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 1);
    let (passed, results, compile_error) = evaluated(&job);
    assert!(passed);
    assert!(compile_error.is_none());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].output.as_deref(), Some("hi\n"));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_compile_error_fails_every_case() {
    let h = Harness::start(2);
    let id = h
        .submit(challenge_job(
            Language::Cpp,
            "syntax-error",
            vec![case("1", "1", false), case("2", "2", true)],
        ))
        .await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Done);
    let (passed, results, compile_error) = evaluated(&job);
    assert!(!passed);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.passed));
    assert!(compile_error.unwrap().contains("error"));
    assert_eq!(h.sandbox.runs(), 0);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let h = Harness::start(1);
    let id = h
        .submit(challenge_job(Language::Python, "loop", vec![case("", "done", false)]))
        .await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Done);
    let (passed, results, _) = evaluated(&job);
    assert!(!passed);
    assert!(results[0].timed_out);
    assert!(!results[0].passed);
    assert_eq!(results[0].time, Some(5.0));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_hidden_cases_are_redacted() {
    let h = Harness::start(1);
    let id = h
        .submit(challenge_job(
            Language::Ruby,
            "echo",
            vec![case("a", "a", false), case("b", "b", true), case("c", "nope", true)],
        ))
        .await;

    let job = h.wait_terminal(id).await;
    let (passed, results, _) = evaluated(&job);
    assert!(!passed);
    assert_eq!(results.len(), 3);

    assert!(results[0].passed);
    assert_eq!(results[0].input.as_deref(), Some("a"));
    assert_eq!(results[0].output.as_deref(), Some("a"));

    for hidden in &results[1..] {
        assert!(hidden.hidden);
        assert!(hidden.input.is_none());
        assert!(hidden.output.is_none());
        assert!(hidden.expected_output.is_none());
        assert!(hidden.stderr.is_none());
        assert!(hidden.time.is_some());
    }
    assert!(results[1].passed);
    assert!(!results[2].passed);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_all_passing_with_hidden_cases() {
    let h = Harness::start(1);
    let id = h
        .submit(challenge_job(
            Language::Python,
            "echo",
            vec![case("1 2", "1 2", true), case("3 4", "3 4", false), case("5 6", "5 6", true)],
        ))
        .await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Done);
    let (passed, results, _) = evaluated(&job);
    assert!(passed);
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.passed && r.time.is_some()));

    let visible = &results[1];
    assert!(!visible.hidden);
    assert_eq!(visible.output.as_deref(), Some("3 4"));
    assert_eq!(visible.input.as_deref(), Some("3 4"));
    assert_eq!(visible.expected_output.as_deref(), Some("3 4"));

    for hidden in [&results[0], &results[2]] {
        assert!(hidden.hidden);
        assert!(hidden.input.is_none());
        assert!(hidden.output.is_none());
        assert!(hidden.expected_output.is_none());
        assert!(hidden.stderr.is_none());
    }

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_transient_infrastructure_failure_is_retried() {
    let h = Harness::start(1);
    let id = h.submit(run_job(Language::Lua, "infra-fail 2", "x")).await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 3);
    assert_eq!(h.sandbox.prepares(), 3);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_persistent_infrastructure_failure_becomes_error() {
    let h = Harness::start(1);
    let id = h.submit(run_job(Language::Lua, "infra-fail 10", "x")).await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.attempts, 3);
    assert_eq!(failure_message(&job), INTERNAL_ERROR_MESSAGE);
    assert!(job.view().submission.is_some());

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_job_ceiling_is_enforced() {
    let (registry, config) = tight_python();
    let h = Harness::with(registry, config);
    let id = h.submit(run_job(Language::Python, "sleep 2000", "")).await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.attempts, 1);
    assert_eq!(failure_message(&job), CEILING_MESSAGE);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_cold_image_pull_does_not_count_against_ceiling() {
    let (registry, config) = tight_python();
    let sandbox = FakeSandbox::new().with_pull_delay(Duration::from_millis(200));
    let h = Harness::assemble(
        registry,
        config,
        sandbox,
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryJobQueue::new()),
    );
    let id = h.submit(run_job(Language::Python, "echo", "warm")).await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 1);
    assert!(evaluated(&job).0);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_failed_image_pull_is_retried() {
    let h = Harness::assemble(
        RuntimeRegistry::builtin(),
        test_config(1),
        FakeSandbox::new().with_failed_pulls(1),
        Arc::new(MemoryJobStore::new()),
        Arc::new(MemoryJobQueue::new()),
    );
    let id = h.submit(run_job(Language::Java, "echo", "x")).await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempts, 2);
    assert_eq!(h.sandbox.pulls(), 2);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_disabled_language_becomes_error() {
    let registry = RuntimeRegistry::builtin().restrict_to(&[Language::Python]);
    let h = Harness::with(registry, test_config(1));
    let id = h.submit(run_job(Language::Lua, "echo", "")).await;

    let job = h.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(failure_message(&job), UNSUPPORTED_MESSAGE);
    assert_eq!(h.sandbox.prepares(), 0);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_single_worker_runs_jobs_in_fifo_order() {
    let h = Harness::start(1);
    let mut ids = Vec::new();
    for stdin in ["1", "2", "3"] {
        ids.push(h.submit(run_job(Language::Python, "echo", stdin)).await);
    }
    for id in ids {
        h.wait_terminal(id).await;
    }
    assert_eq!(h.sandbox.stdin_log(), vec!["1", "2", "3"]);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_older_job_runs_first_across_languages() {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let python = run_job(Language::Python, "echo", "python-first");
    let c = run_job(Language::C, "echo", "c-second");
    for job in [&python, &c] {
        store.insert(job).await.unwrap();
        queue.push(job.language, job.id).await.unwrap();
    }

    // One worker serving every language; Language::ALL lists c first.
    let h = Harness::assemble(RuntimeRegistry::builtin(), test_config(1), FakeSandbox::new(), store, queue);
    h.wait_terminal(python.id).await;
    h.wait_terminal(c.id).await;
    assert_eq!(h.sandbox.stdin_log(), vec!["python-first", "c-second"]);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_unclaimable_job_goes_back_to_its_own_queue() {
    let store = Arc::new(ClaimOutage(MemoryJobStore::new()));
    let queue = Arc::new(MemoryJobQueue::new());
    let job = run_job(Language::Lua, "echo", "");
    store.insert(&job).await.unwrap();
    queue.push(Language::Lua, job.id).await.unwrap();

    let deps = PoolDeps {
        store: store.clone(),
        queue: queue.clone(),
        sandbox: Arc::new(FakeSandbox::new()),
        registry: Arc::new(RuntimeRegistry::builtin()),
    };
    let config = PoolConfig {
        languages: vec![Language::Python, Language::Lua],
        ..test_config(1)
    };
    let pool = WorkerPool::start(deps, config);
    // Long enough for several claim-and-requeue rounds.
    tokio::time::sleep(Duration::from_millis(60)).await;
    pool.shutdown().await;

    let wait = Duration::from_millis(10);
    assert_eq!(queue.pop(&[Language::Python], wait).await.unwrap(), None);
    assert_eq!(
        queue.pop(&[Language::Lua], wait).await.unwrap(),
        Some((Language::Lua, job.id))
    );
    assert_eq!(queue.len().await, 0);
    assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_concurrency_is_bounded_by_worker_count() {
    let h = Harness::start(2);
    assert_eq!(h.pool.size(), 2);
    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(h.submit(run_job(Language::Python, "sleep 40", "")).await);
    }
    for id in ids {
        assert_eq!(h.wait_terminal(id).await.status, JobStatus::Done);
    }
    assert!(h.sandbox.max_concurrent() <= 2);
    assert!(h.sandbox.max_concurrent() >= 1);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_job() {
    let h = Harness::start(1);
    let id = h.submit(run_job(Language::Python, "sleep 200", "late")).await;
    h.wait_status(id, JobStatus::Running).await;

    let Harness { store, pool, .. } = h;
    pool.shutdown().await;

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn test_already_claimed_job_is_left_alone() {
    let h = Harness::start(1);

    let taken = run_job(Language::Python, "echo", "taken");
    h.store.insert(&taken).await.unwrap();
    h.store.claim(taken.id).await.unwrap().unwrap();
    h.queue.push(Language::Python, taken.id).await.unwrap();

    let next = h.submit(run_job(Language::Python, "echo", "next")).await;
    h.wait_terminal(next).await;

    let taken = h.store.get(taken.id).await.unwrap().unwrap();
    assert_eq!(taken.status, JobStatus::Running);
    assert!(taken.submission.is_none());
    assert_eq!(h.sandbox.stdin_log(), vec!["next"]);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_unknown_job_id_is_skipped() {
    let h = Harness::start(1);
    h.queue.push(Language::Python, Uuid::new_v4()).await.unwrap();
    let id = h.submit(run_job(Language::Python, "echo", "ok")).await;

    assert_eq!(h.wait_terminal(id).await.status, JobStatus::Done);
    assert_eq!(h.queue.len().await, 0);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_compiled_challenge_builds_once() {
    let h = Harness::start(1);
    let id = h
        .submit(challenge_job(
            Language::Cpp,
            "echo",
            vec![case("1", "1", false), case("2", "2", false), case("3", "3", false)],
        ))
        .await;

    let job = h.wait_terminal(id).await;
    assert!(evaluated(&job).0);
    assert_eq!(h.sandbox.prepares(), 1);
    assert_eq!(h.sandbox.runs(), 3);
    assert_eq!(h.sandbox.stdin_log(), vec!["1", "2", "3"]);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    let h = Harness::start(1);
    let id = h.submit(run_job(Language::Python, "sleep 100", "")).await;

    let rank = |status: JobStatus| match status {
        JobStatus::Pending => 0,
        JobStatus::Running => 1,
        JobStatus::Done | JobStatus::Error => 2,
    };

    let mut seen = Vec::new();
    let mut last_updated = None;
    loop {
        let job = h.store.get(id).await.unwrap().unwrap();
        if let Some(prev) = last_updated {
            assert!(job.updated_at >= prev);
        }
        last_updated = Some(job.updated_at);
        seen.push(rank(job.status));
        if job.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert!(seen.contains(&1));
    assert_eq!(*seen.last().unwrap(), 2);

    h.pool.shutdown().await;
}
