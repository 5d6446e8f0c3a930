// In-memory application state for handler tests.

use crate::AppState;
use kiln_common::challenge::MemoryChallenges;
use kiln_common::config::Settings;
use kiln_common::queue::MemoryJobQueue;
use kiln_common::runtime::RuntimeRegistry;
use kiln_common::store::{JobStore, MemoryJobStore};
use kiln_common::types::Job;
use std::sync::Arc;
use uuid::Uuid;

pub struct TestState {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub challenges: Arc<MemoryChallenges>,
}

impl TestState {
    pub async fn store_get(&self, id: Uuid) -> Job {
        self.store.get(id).await.unwrap().expect("job exists")
    }
}

pub fn state(registry: RuntimeRegistry, settings: Settings) -> TestState {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let challenges = Arc::new(MemoryChallenges::new());
    let state = Arc::new(AppState {
        store: store.clone(),
        queue: queue.clone(),
        challenges: challenges.clone(),
        registry: Arc::new(registry),
        settings,
    });
    TestState {
        state,
        store,
        queue,
        challenges,
    }
}

pub fn test_state() -> TestState {
    state(RuntimeRegistry::builtin(), Settings::default())
}
