//! Bounded, concurrent store of rate limit counters.
//!
//! The table is a sharded [`DashMap`] of reference-counted entries. Each entry
//! carries its own async mutex, so requests for the same key are serialized
//! while requests for different keys never contend beyond a shard lookup.
//! The mutex also provides single-flight hydration: the first caller to take
//! the lock of an empty entry runs the loader, later callers find the state
//! already in place.
//!
//! Capacity is enforced by reserving a slot against an atomic counter before
//! inserting, so the number of live entries never exceeds the configured
//! size. When the table is full one caller at a time evicts a batch of the
//! least recently used idle entries. An entry whose lock is held is never
//! evicted; a caller that was waiting on the lock of an entry evicted in the
//! meantime notices on acquisition and retries against the live table.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace};

use super::algorithm::{BuiltinAlgorithms, RateLimitAlgorithm};
use super::descriptor::RateLimitKey;
use super::state::{RateLimitRequest, RateLimitResponse, RateLimitState, RequestState};
use super::store::{Loader, Storer};
use crate::context::RequestContext;
use crate::error::{RingLimitError, Result};

/// Default number of entries the cache holds.
pub const DEFAULT_CACHE_SIZE: usize = 50_000;

/// Fraction of the capacity freed by one eviction pass.
const EVICTION_BATCH_DIVISOR: usize = 16;

struct CacheEntry {
    /// `None` until the first caller hydrates or initializes the entry
    state: Mutex<Option<RateLimitState>>,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn new(tick: u64) -> Self {
        Self {
            state: Mutex::new(None),
            last_access: AtomicU64::new(tick),
        }
    }

    fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn is_idle(&self) -> bool {
        self.state.try_lock().is_ok()
    }
}

/// Unpublishes an empty entry if its load fails or is dropped, so the entry
/// does not keep holding a capacity slot.
///
/// Only armed while the caller holds the entry lock and the slot is `None`.
/// Waiters re-check publication after locking, so removal is always safe.
struct PlaceholderGuard<'a> {
    cache: &'a RateLimitCache,
    key: &'a RateLimitKey,
    entry: &'a Arc<CacheEntry>,
    armed: bool,
}

impl PlaceholderGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PlaceholderGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.cache.remove_entry(self.key, self.entry) {
            trace!(key = %self.key, "Removed uninitialized entry");
        }
    }
}

/// The per-node authoritative store of rate limit state.
pub struct RateLimitCache {
    entries: DashMap<RateLimitKey, Arc<CacheEntry>>,
    capacity: usize,
    /// Live entries plus slots reserved by in-flight inserts
    reserved: AtomicUsize,
    tick: AtomicU64,
    evictions: AtomicU64,
    evicting: parking_lot::Mutex<()>,
    loader: Option<Arc<dyn Loader>>,
    storer: Option<Arc<dyn Storer>>,
    algorithm: Arc<dyn RateLimitAlgorithm>,
}

impl std::fmt::Debug for RateLimitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitCache")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.len())
            .field("has_loader", &self.loader.is_some())
            .field("has_storer", &self.storer.is_some())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl RateLimitCache {
    /// Create a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            reserved: AtomicUsize::new(0),
            tick: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            evicting: parking_lot::Mutex::new(()),
            loader: None,
            storer: None,
            algorithm: Arc::new(BuiltinAlgorithms),
        }
    }

    /// Hydrate missing keys from `loader`.
    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Flush contents to `storer` on [`RateLimitCache::store`].
    pub fn with_storer(mut self, storer: Arc<dyn Storer>) -> Self {
        self.storer = Some(storer);
        self
    }

    /// Replace the decision function applied to every entry.
    pub fn with_algorithm(mut self, algorithm: Arc<dyn RateLimitAlgorithm>) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries evicted since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &RateLimitKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Copy of the state held for `key`, waiting for any in-flight update.
    pub async fn peek(&self, key: &RateLimitKey) -> Option<RateLimitState> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        let slot = entry.state.lock().await;
        *slot
    }

    /// Check `request` against its key and apply its hits.
    ///
    /// Calls for the same key are serialized. If `ctx` expires before the
    /// update is committed the call fails with `DeadlineExceeded` (or
    /// `Cancelled`) and the key's state is left exactly as it was.
    #[instrument(
        skip(self, ctx, request),
        fields(key = %request.key, hits = request.hits, forwarded = req_state.forwarded)
    )]
    pub async fn get_rate_limit(
        &self,
        ctx: &RequestContext,
        request: &RateLimitRequest,
        req_state: RequestState,
    ) -> Result<RateLimitResponse> {
        request.config.validate()?;
        ctx.run(self.check_and_update(request)).await
    }

    async fn check_and_update(&self, request: &RateLimitRequest) -> Result<RateLimitResponse> {
        loop {
            let entry = self.acquire_entry(&request.key).await;
            let mut slot = entry.state.lock().await;

            if !self.is_published(&request.key, &entry) {
                trace!(key = %request.key, "Entry evicted while waiting, retrying");
                continue;
            }

            let current = match *slot {
                Some(state) => Some(state),
                None => {
                    let placeholder = PlaceholderGuard {
                        cache: self,
                        key: &request.key,
                        entry: &entry,
                        armed: true,
                    };
                    let loaded = self.load(&request.key).await?;
                    placeholder.disarm();
                    loaded
                }
            };

            // Everything below is synchronous, so the update commits as a unit
            let now = request.timestamp();
            let mut state = match current {
                Some(state) if state.matches(&request.config) => state,
                Some(_) => {
                    debug!(key = %request.key, "Limit changed, resetting counter state");
                    self.algorithm.initial_state(&request.config, now)
                }
                None => self.algorithm.initial_state(&request.config, now),
            };

            let response = self.algorithm.apply(&mut state, request.hits, now);
            *slot = Some(state);
            entry.touch(self.next_tick());

            trace!(
                key = %request.key,
                status = ?response.status,
                remaining = response.remaining,
                "Rate limit applied"
            );
            return Ok(response);
        }
    }

    /// Flush the current contents to the configured storer.
    ///
    /// Each entry is copied under its own lock, so the flush sees every key
    /// in a committed state without pausing the whole table.
    #[instrument(skip(self, ctx))]
    pub async fn store(&self, ctx: &RequestContext) -> Result<()> {
        let Some(storer) = self.storer.clone() else {
            debug!("No storer configured, skipping flush");
            return Ok(());
        };

        ctx.run(async move {
            let snapshot: Vec<(RateLimitKey, Arc<CacheEntry>)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();

            let mut items = Vec::with_capacity(snapshot.len());
            for (key, entry) in snapshot {
                if let Some(state) = *entry.state.lock().await {
                    items.push((key, state));
                }
            }

            let count = items.len();
            storer
                .store_all(items)
                .await
                .map_err(|e| RingLimitError::StoreFailure(format!("{e:#}")))?;

            info!(count, "Flushed rate limit cache to storer");
            Ok(())
        })
        .await
    }

    async fn load(&self, key: &RateLimitKey) -> Result<Option<RateLimitState>> {
        let Some(loader) = &self.loader else {
            return Ok(None);
        };

        let loaded = loader
            .load(key)
            .await
            .map_err(|e| RingLimitError::LoaderFailure(format!("{e:#}")))?;

        debug!(key = %key, found = loaded.is_some(), "Hydrated entry from loader");
        Ok(loaded)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_published(&self, key: &RateLimitKey, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    fn remove_entry(&self, key: &RateLimitKey, entry: &Arc<CacheEntry>) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if removed {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Find the entry for `key`, inserting an empty one if needed.
    async fn acquire_entry(&self, key: &RateLimitKey) -> Arc<CacheEntry> {
        if let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) {
            entry.touch(self.next_tick());
            return entry;
        }

        self.reserve_slot().await;

        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                // Lost the insert race, give the slot back
                self.reserved.fetch_sub(1, Ordering::AcqRel);
                let entry = occupied.get().clone();
                entry.touch(self.next_tick());
                entry
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CacheEntry::new(self.next_tick()));
                vacant.insert(entry.clone());
                entry
            }
        }
    }

    async fn reserve_slot(&self) {
        loop {
            let reserved = self.reserved.load(Ordering::Acquire);
            if reserved < self.capacity {
                if self
                    .reserved
                    .compare_exchange_weak(
                        reserved,
                        reserved + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            if self.evict() == 0 {
                // Another caller is evicting or every entry is busy
                tokio::task::yield_now().await;
            }
        }
    }

    /// Evict a batch of the least recently used idle entries.
    ///
    /// Returns the number of slots now available to retry with.
    fn evict(&self) -> usize {
        let Some(_evicting) = self.evicting.try_lock() else {
            return 0;
        };

        let reserved = self.reserved.load(Ordering::Acquire);
        if reserved < self.capacity {
            return self.capacity - reserved;
        }

        // Rank idle entries only, so busy ones cannot pin the cutoff
        let mut ticks: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.value().is_idle())
            .map(|e| e.value().last_access())
            .collect();
        if ticks.is_empty() {
            return 0;
        }

        let batch = (self.capacity / EVICTION_BATCH_DIVISOR).clamp(1, ticks.len());
        let (_, cutoff, _) = ticks.select_nth_unstable(batch - 1);
        let cutoff = *cutoff;

        let victims: Vec<(RateLimitKey, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.value().last_access() <= cutoff && e.value().is_idle())
            .take(batch)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut removed = 0;
        for (key, entry) in victims {
            // Entries with an update in flight are skipped
            let Ok(_idle) = entry.state.try_lock() else {
                continue;
            };
            if self.remove_entry(&key, &entry) {
                removed += 1;
            }
        }

        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        debug!(removed, capacity = self.capacity, "Evicted least recently used entries");
        removed
    }
}
