use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;
use crate::rate_limit::key::RateLimitKey;
use crate::rate_limit::registry::LocalBucketRegistry;
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::tier::TierConfig;
use crate::rate_limit::{Decision, RateLimiter};

/// Default budget for one shared store round-trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// A Token Bucket rate limiter over a [`LocalBucketRegistry`].
///
/// Refill-then-consume runs under the key's own lock, so concurrent requests for one key
/// are serialized and distinct keys never wait on each other.
#[derive(Debug, Clone, Default)]
pub struct TokenBucketLimiter {
    registry: LocalBucketRegistry,
}

impl TokenBucketLimiter {
    /// Create a limiter backed by `registry`.
    pub fn new(registry: LocalBucketRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &LocalBucketRegistry {
        &self.registry
    }

    /// Charge `cost` tokens against `key`. Synchronous: only the bucket lock is awaited.
    ///
    /// A cost above capacity can never succeed and is denied without touching the bucket.
    pub fn consume(&self, key: &RateLimitKey, tier: &TierConfig, cost: u64) -> Decision {
        if cost > tier.capacity() {
            let remaining = self.registry.peek(key).map_or(tier.capacity(), |s| s.tokens());
            warn!(
                target: "tollgate::limiter",
                key = %key,
                cost,
                capacity = tier.capacity(),
                "cost exceeds bucket capacity; request can never be admitted"
            );
            return Decision::denied(remaining, tier.full_refill_time());
        }
        let handle = self.registry.get_or_create(key, tier);
        handle.with_state(|state| {
            // read the clock under the lock so consumers of one key see ordered readings
            let now = self.registry.now_millis();
            state.try_consume(tier, cost, now)
        })
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(
        &self,
        key: &RateLimitKey,
        tier: &TierConfig,
        cost: u64,
    ) -> Result<Decision, StoreError> {
        Ok(self.consume(key, tier, cost))
    }
}

/// Fixed-window limiter over a shared [`CounterStore`].
///
/// The tier's `capacity` is the per-window limit and its `refill_interval` the window.
/// Every call is a single store round-trip bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store, timeout: DEFAULT_STORE_TIMEOUT }
    }

    /// Override the round-trip budget. Panics if `timeout` is zero.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        assert!(timeout > Duration::ZERO, "store timeout must be non-zero");
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(
        &self,
        key: &RateLimitKey,
        tier: &TierConfig,
        cost: u64,
    ) -> Result<Decision, StoreError> {
        let limit = tier.capacity();
        let window = tier.refill_interval();
        if cost > limit {
            return Ok(Decision::denied(0, window));
        }

        let store_key = key.to_string();
        let start = Instant::now();
        let snapshot =
            tokio::time::timeout(self.timeout, self.store.increment_and_get(&store_key, cost, window))
                .await
                .map_err(|_| StoreError::Timeout { key: store_key.clone(), timeout: self.timeout })??;

        tracing::trace!(
            target: "tollgate::store",
            key = %store_key,
            count = snapshot.count,
            first = snapshot.first_in_window,
            elapsed_us = start.elapsed().as_micros() as u64,
            "counter incremented"
        );

        let remaining = limit.saturating_sub(snapshot.count);
        if snapshot.count <= limit {
            Ok(Decision::allowed(remaining))
        } else {
            Ok(Decision::denied(remaining, snapshot.expires_in.unwrap_or(window)))
        }
    }
}
