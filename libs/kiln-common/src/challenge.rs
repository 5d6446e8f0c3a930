// Narrow read-only view of the challenge document store.

use crate::store::StoreError;
use crate::types::{Caller, TestCase};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Challenge {
    /// Published challenges are open to everyone; drafts only to their
    /// author and administrators.
    pub fn accessible_by(&self, caller: &Caller) -> bool {
        self.published || caller.is_admin() || self.owner_id == caller.id
    }
}

#[async_trait]
pub trait ChallengeRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Challenge>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryChallenges {
    challenges: RwLock<HashMap<String, Challenge>>,
}

impl MemoryChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, challenge: Challenge) {
        self.challenges
            .write()
            .await
            .insert(challenge.id.clone(), challenge);
    }
}

#[async_trait]
impl ChallengeRepository for MemoryChallenges {
    async fn get(&self, id: &str) -> Result<Option<Challenge>, StoreError> {
        Ok(self.challenges.read().await.get(id).cloned())
    }
}
