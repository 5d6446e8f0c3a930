use crate::challenge::{Challenge, ChallengeRepository};
use crate::queue::JobQueue;
use crate::store::{JobStore, StoreError};
use crate::types::{Job, JobStatus, Language, Submission};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Redis key semantics shared by the API and the worker, so the two never
/// drift and queue names stay predictable for autoscalers.

pub const QUEUE_PREFIX: &str = "kiln:queue";
pub const JOB_PREFIX: &str = "kiln:job";
pub const STATUS_PREFIX: &str = "kiln:status";
pub const CHALLENGE_PREFIX: &str = "kiln:challenge";

/// Deterministic queue name for a language
pub fn queue_name(language: &Language) -> String {
    format!("{}:{}", QUEUE_PREFIX, language)
}

/// Key holding the full job record (JSON)
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Key holding just the status string; the CAS scripts compare on it
pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

pub fn challenge_key(challenge_id: &str) -> String {
    format!("{}:{}", CHALLENGE_PREFIX, challenge_id)
}

// KEYS: status, job. ARGV: status, job json.
const INSERT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
return 1
";

// KEYS: status, job. ARGV: expected status, new status, job json, ttl secs.
const TRANSITION_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[3])
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
  redis.call('EXPIRE', KEYS[2], ttl)
end
return 1
";

/// Job store backed by Redis. Transitions are Lua scripts, so the
/// compare-and-set on the status key is atomic across processes.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    result_ttl: Option<Duration>,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager, result_ttl: Option<Duration>) -> Self {
        Self { conn, result_ttl }
    }

    async fn load(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(job_key(&id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(status_key(&id)).await?;
        Ok(raw.and_then(|s| parse_status(&s)))
    }

    /// Run the transition script. Returns the raw script verdict.
    async fn transition(&self, job: &Job, expected: JobStatus, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let verdict: i64 = Script::new(TRANSITION_SCRIPT)
            .key(status_key(&job.id))
            .key(job_key(&job.id))
            .arg(expected.as_str())
            .arg(job.status.as_str())
            .arg(payload)
            .arg(ttl.map(|t| t.as_secs()).unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;
        Ok(verdict)
    }
}

fn parse_status(raw: &str) -> Option<JobStatus> {
    match raw {
        "pending" => Some(JobStatus::Pending),
        "running" => Some(JobStatus::Running),
        "done" => Some(JobStatus::Done),
        "error" => Some(JobStatus::Error),
        _ => None,
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        if job.status != JobStatus::Pending {
            return Err(StoreError::Conflict {
                id: job.id,
                expected: JobStatus::Pending,
                actual: job.status,
            });
        }
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let inserted: i64 = Script::new(INSERT_SCRIPT)
            .key(status_key(&job.id))
            .key(job_key(&job.id))
            .arg(job.status.as_str())
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        if inserted == 0 {
            return Err(StoreError::AlreadyExists { id: job.id });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.load(id).await
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let Some(mut job) = self.load(id).await? else {
            return Err(StoreError::NotFound(id));
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }
        job.transition(JobStatus::Running)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match self.transition(&job, JobStatus::Pending, None).await? {
            1 => Ok(Some(job)),
            -1 => Err(StoreError::NotFound(id)),
            _ => Ok(None),
        }
    }

    async fn finish(&self, id: Uuid, submission: Submission, attempts: u32) -> Result<Job, StoreError> {
        let Some(mut job) = self.load(id).await? else {
            return Err(StoreError::NotFound(id));
        };
        if job.status != JobStatus::Running {
            return Err(StoreError::Conflict {
                id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        job.attempts = attempts;
        job.finish(submission)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match self.transition(&job, JobStatus::Running, self.result_ttl).await? {
            1 => Ok(job),
            -1 => Err(StoreError::NotFound(id)),
            _ => {
                let actual = self.current_status(id).await?.unwrap_or(JobStatus::Running);
                Err(StoreError::Conflict {
                    id,
                    expected: JobStatus::Running,
                    actual,
                })
            }
        }
    }
}

/// Global submission counter; every queue entry is stamped from it.
pub const QUEUE_SEQ_KEY: &str = "kiln:seq:queue";

/// Poll step for multi-language pops.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(50);

// KEYS: queue, sequence. ARGV: job id.
const PUSH_SCRIPT: &str = r"
local seq = redis.call('INCR', KEYS[2])
redis.call('RPUSH', KEYS[1], seq .. ':' .. ARGV[1])
return seq
";

// KEYS: queues. Pops the head with the lowest sequence number.
const POP_OLDEST_SCRIPT: &str = r"
local best, best_seq = nil, nil
for i, key in ipairs(KEYS) do
  local head = redis.call('LINDEX', key, 0)
  if head then
    local seq = tonumber(string.match(head, '^(%d+):')) or 0
    if not best_seq or seq < best_seq then
      best, best_seq = i, seq
    end
  end
end
if not best then
  return false
end
return {KEYS[best], redis.call('LPOP', KEYS[best])}
";

/// Language encoded in a queue key.
fn queue_language(key: &str) -> Option<Language> {
    key.strip_prefix(QUEUE_PREFIX)?
        .strip_prefix(':')
        .and_then(Language::from_str)
}

/// Decode a `(queue key, entry)` pair; entries are `<seq>:<job id>`.
fn parse_entry(key: &str, entry: &str) -> Result<(Language, Uuid), StoreError> {
    let language =
        queue_language(key).ok_or_else(|| StoreError::Backend(format!("unexpected queue key '{}'", key)))?;
    let id = entry.rsplit(':').next().unwrap_or(entry);
    let job_id = Uuid::parse_str(id)
        .map_err(|e| StoreError::Backend(format!("malformed queue entry '{}': {}", entry, e)))?;
    Ok((language, job_id))
}

/// Per-language FIFO lists: RPUSH at the tail, pop from the head.
///
/// A pool serving one language blocks on `BLPOP`. A pool serving several
/// compares the sequence stamps at the list heads and takes the oldest,
/// so a busy language never starves a quieter one.
pub struct RedisJobQueue {
    client: redis::Client,
    conn: ConnectionManager,
    // BLPOP parks its connection, so blocking pops get their own.
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisJobQueue {
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn blocking_conn(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn blocking_pop(&self, key: String, wait: Duration) -> Result<Option<(String, String)>, StoreError> {
        let mut conn = self.blocking_conn().await?;
        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&key)
            .arg(wait.as_secs_f64().max(0.01))
            .query_async(&mut conn)
            .await?;
        self.idle.lock().await.push(conn);
        Ok(result)
    }

    async fn oldest_pop(&self, keys: &[String], wait: Duration) -> Result<Option<(String, String)>, StoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        let script = Script::new(POP_OLDEST_SCRIPT);
        loop {
            let mut conn = self.conn.clone();
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            let popped: Option<(String, String)> = invocation.invoke_async(&mut conn).await?;
            if popped.is_some() {
                return Ok(popped);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn push(&self, language: Language, job_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(PUSH_SCRIPT)
            .key(queue_name(&language))
            .key(QUEUE_SEQ_KEY)
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, languages: &[Language], wait: Duration) -> Result<Option<(Language, Uuid)>, StoreError> {
        let mut keys: Vec<String> = languages.iter().map(queue_name).collect();
        let popped = match keys.len() {
            0 => {
                tokio::time::sleep(wait).await;
                return Ok(None);
            }
            1 => self.blocking_pop(keys.remove(0), wait).await?,
            _ => self.oldest_pop(&keys, wait).await?,
        };

        popped.map(|(key, entry)| parse_entry(&key, &entry)).transpose()
    }
}

/// Challenges stored as JSON documents under `kiln:challenge:<id>`.
#[derive(Clone)]
pub struct RedisChallenges {
    conn: ConnectionManager,
}

impl RedisChallenges {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ChallengeRepository for RedisChallenges {
    async fn get(&self, id: &str) -> Result<Option<Challenge>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(challenge_key(id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }
}
