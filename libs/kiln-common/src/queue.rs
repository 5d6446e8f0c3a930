// Job Queue: FIFO hand-off of job ids from the API to the worker pool.
// One logical queue per language, mirroring the Redis key layout. A pop
// over several languages takes the oldest submission among them; no
// language outranks another.

use crate::store::StoreError;
use crate::types::Language;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job id to the tail of its language queue.
    async fn push(&self, language: Language, job_id: Uuid) -> Result<(), StoreError>;

    /// Pop the oldest job queued for any of `languages`, waiting up to
    /// `wait`. The language travels with the id so it can be requeued
    /// without reading the job record. `Ok(None)` on timeout.
    async fn pop(&self, languages: &[Language], wait: Duration) -> Result<Option<(Language, Uuid)>, StoreError>;
}

/// In-process queue used by tests and single-node development.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    entries: Mutex<VecDeque<(Language, Uuid)>>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn take(&self, languages: &[Language]) -> Option<(Language, Uuid)> {
        let mut entries = self.entries.lock().await;
        let pos = entries.iter().position(|(lang, _)| languages.contains(lang))?;
        entries.remove(pos)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, language: Language, job_id: Uuid) -> Result<(), StoreError> {
        self.entries.lock().await.push_back((language, job_id));
        self.notify.notify_waiters();
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, languages: &[Language], wait: Duration) -> Result<Option<(Language, Uuid)>, StoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.take(languages).await {
                return Ok(Some(entry));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_per_language() {
        let queue = MemoryJobQueue::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push(Language::Python, a).await.unwrap();
        queue.push(Language::Cpp, b).await.unwrap();
        queue.push(Language::Python, c).await.unwrap();

        let wait = Duration::from_millis(10);
        assert_eq!(queue.pop(&[Language::Python], wait).await.unwrap(), Some((Language::Python, a)));
        assert_eq!(queue.pop(&[Language::Python], wait).await.unwrap(), Some((Language::Python, c)));
        assert_eq!(queue.pop(&[Language::Python], wait).await.unwrap(), None);
        assert_eq!(
            queue.pop(&[Language::Python, Language::Cpp], wait).await.unwrap(),
            Some((Language::Cpp, b))
        );
    }

    #[tokio::test]
    async fn test_oldest_job_wins_across_languages() {
        let queue = MemoryJobQueue::new();
        let (python, c, ruby) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push(Language::Python, python).await.unwrap();
        queue.push(Language::C, c).await.unwrap();
        queue.push(Language::Ruby, ruby).await.unwrap();

        let wait = Duration::from_millis(10);
        // Language::ALL lists c before python; submission order still wins.
        assert_eq!(queue.pop(&Language::ALL, wait).await.unwrap(), Some((Language::Python, python)));
        assert_eq!(queue.pop(&Language::ALL, wait).await.unwrap(), Some((Language::C, c)));
        // Languages outside the set are skipped, not reordered.
        assert_eq!(queue.pop(&[Language::Lua], wait).await.unwrap(), None);
        assert_eq!(queue.pop(&Language::ALL, wait).await.unwrap(), Some((Language::Ruby, ruby)));
    }

    #[tokio::test]
    async fn test_pop_times_out_when_empty() {
        let queue = MemoryJobQueue::new();
        let started = std::time::Instant::now();
        let popped = queue.pop(&Language::ALL, Duration::from_millis(50)).await.unwrap();
        assert!(popped.is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(MemoryJobQueue::new());
        let id = Uuid::new_v4();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop(&[Language::Ruby], Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Language::Ruby, id).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Some((Language::Ruby, id)));
    }
}
