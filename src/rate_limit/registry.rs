//! Process-local map from key to bucket.
//!
//! Sharded (`DashMap`) so distinct keys rarely contend; each bucket sits behind its own
//! mutex so consumers of one key never block another key once the handle is fetched.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::clock::{Clock, MonotonicClock};
use crate::rate_limit::bucket::BucketState;
use crate::rate_limit::key::RateLimitKey;
use crate::rate_limit::tier::TierConfig;
use crate::rate_limit::as_millis;

/// Handle to one key's bucket. Holding a handle pins the entry: sweeps skip it.
#[derive(Debug, Clone)]
pub struct BucketHandle {
    state: Arc<Mutex<BucketState>>,
}

impl BucketHandle {
    /// Run `f` with exclusive access to the bucket.
    ///
    /// A poisoned lock is recovered: the state is two integers written together and
    /// cannot be observed half-updated.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut BucketState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> BucketState {
        self.with_state(|s| *s)
    }
}

/// In-memory bucket registry. Clones share the same buckets.
#[derive(Debug, Clone)]
pub struct LocalBucketRegistry {
    buckets: Arc<DashMap<RateLimitKey, Arc<Mutex<BucketState>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalBucketRegistry {
    fn default() -> Self {
        Self::with_clock(MonotonicClock::default())
    }
}

impl LocalBucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry reading time from `clock` (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self::with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(clock: Arc<dyn Clock>) -> Self {
        Self { buckets: Arc::new(DashMap::new()), clock }
    }

    /// Current reading of the registry clock.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Fetch the bucket for `key`, creating a full one for `tier` on first use.
    pub fn get_or_create(&self, key: &RateLimitKey, tier: &TierConfig) -> BucketHandle {
        if let Some(existing) = self.buckets.get(key) {
            return BucketHandle { state: existing.value().clone() };
        }
        let now = self.clock.now_millis();
        let state = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BucketState::full(tier, now))))
            .value()
            .clone();
        BucketHandle { state }
    }

    /// Current state for `key` without creating it.
    pub fn peek(&self, key: &RateLimitKey) -> Option<BucketState> {
        let state = self.buckets.get(key).map(|entry| entry.value().clone())?;
        Some(BucketHandle { state }.snapshot())
    }

    /// Drop buckets whose last refill is older than `max_idle`. Returns how many were removed.
    ///
    /// An entry is kept while any [`BucketHandle`] to it is alive or its lock is held.
    /// Handles are only issued under the shard lock `retain` holds, so the count check
    /// cannot race with a new consumer.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let max_idle = as_millis(max_idle);
        let before = self.buckets.len();
        self.buckets.retain(|_, state| {
            if Arc::strong_count(state) > 1 {
                return true;
            }
            match state.try_lock() {
                Ok(guard) => now.saturating_sub(guard.last_refill_millis()) <= max_idle,
                Err(std::sync::TryLockError::Poisoned(p)) => {
                    now.saturating_sub(p.into_inner().last_refill_millis()) <= max_idle
                }
                Err(std::sync::TryLockError::WouldBlock) => true,
            }
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(target: "tollgate::registry", removed, remaining = self.buckets.len(), "swept idle buckets");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
