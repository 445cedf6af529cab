//! Guidance session persistence

use super::{GuidanceKey, GuidanceState};
use askforge_common::cache::{keys, Cache};
use askforge_common::errors::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[async_trait]
pub trait GuidanceStore: Send + Sync {
    async fn load(&self, key: &GuidanceKey) -> Result<Option<GuidanceState>>;
    async fn save(&self, key: &GuidanceKey, state: &GuidanceState) -> Result<()>;
    async fn clear(&self, key: &GuidanceKey) -> Result<()>;
}

/// Process-local store; sessions expire `ttl` after their last save
pub struct InMemoryGuidanceStore {
    ttl: Duration,
    sessions: Mutex<HashMap<GuidanceKey, (GuidanceState, Instant)>>,
}

impl InMemoryGuidanceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl GuidanceStore for InMemoryGuidanceStore {
    async fn load(&self, key: &GuidanceKey) -> Result<Option<GuidanceState>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        sessions.retain(|_, (_, saved)| now.duration_since(*saved) < self.ttl);
        Ok(sessions.get(key).map(|(state, _)| state.clone()))
    }

    async fn save(&self, key: &GuidanceKey, state: &GuidanceState) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(key.clone(), (state.clone(), Instant::now()));
        Ok(())
    }

    async fn clear(&self, key: &GuidanceKey) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(key);
        Ok(())
    }
}

/// Redis-backed store shared across gateway instances
pub struct RedisGuidanceStore {
    cache: Arc<Cache>,
    ttl_secs: u64,
}

impl RedisGuidanceStore {
    pub fn new(cache: Arc<Cache>, ttl_secs: u64) -> Self {
        Self { cache, ttl_secs }
    }

    fn cache_key(key: &GuidanceKey) -> String {
        keys::guidance(&key.conversation_id, &key.user_id)
    }
}

#[async_trait]
impl GuidanceStore for RedisGuidanceStore {
    async fn load(&self, key: &GuidanceKey) -> Result<Option<GuidanceState>> {
        self.cache.get(&Self::cache_key(key)).await
    }

    async fn save(&self, key: &GuidanceKey, state: &GuidanceState) -> Result<()> {
        self.cache
            .set_with_ttl(&Self::cache_key(key), state, self.ttl_secs)
            .await
    }

    async fn clear(&self, key: &GuidanceKey) -> Result<()> {
        self.cache.delete(&Self::cache_key(key)).await?;
        Ok(())
    }
}
