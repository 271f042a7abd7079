//! Loader/Storer hooks the cache uses to hydrate misses and flush contents.
//!
//! Both are external collaborators. [`MemoryStore`] is an in-process
//! implementation of both, useful for tests and for seeding a node.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::descriptor::RateLimitKey;
use super::state::RateLimitState;

/// Hydrates a key the cache does not hold.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Return the persisted state for `key`, or `None` if nothing is stored.
    async fn load(&self, key: &RateLimitKey) -> anyhow::Result<Option<RateLimitState>>;
}

/// Durably flushes cache contents.
#[async_trait]
pub trait Storer: Send + Sync {
    async fn store_all(&self, items: Vec<(RateLimitKey, RateLimitState)>) -> anyhow::Result<()>;
}

/// In-memory [`Loader`] and [`Storer`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: DashMap<RateLimitKey, RateLimitState>,
    loads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &RateLimitKey) -> Option<RateLimitState> {
        self.items.get(key).map(|state| *state)
    }

    pub fn insert(&self, key: RateLimitKey, state: RateLimitState) {
        self.items.insert(key, state);
    }
}

#[async_trait]
impl Loader for MemoryStore {
    async fn load(&self, key: &RateLimitKey) -> anyhow::Result<Option<RateLimitState>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(key))
    }
}

#[async_trait]
impl Storer for MemoryStore {
    async fn store_all(&self, items: Vec<(RateLimitKey, RateLimitState)>) -> anyhow::Result<()> {
        for (key, state) in items {
            self.items.insert(key, state);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::state::Algorithm;

    fn state(remaining: u64) -> RateLimitState {
        RateLimitState {
            algorithm: Algorithm::TokenBucket,
            limit: 10,
            duration_ms: 1_000,
            remaining,
            anchor_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_store_load_miss() {
        let store = MemoryStore::new();
        let loaded = store.load(&RateLimitKey::from("missing")).await.unwrap();
        assert!(loaded.is_none());
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_store_then_load() {
        let store = MemoryStore::new();
        store
            .store_all(vec![
                (RateLimitKey::from("a"), state(1)),
                (RateLimitKey::from("b"), state(2)),
            ])
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        let loaded = store.load(&RateLimitKey::from("b")).await.unwrap();
        assert_eq!(loaded, Some(state(2)));
    }
}
