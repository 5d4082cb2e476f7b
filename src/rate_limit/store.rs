use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;
use crate::rate_limit::as_millis;

/// Result of one increment on a shared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Counter value after the increment.
    pub count: u64,
    /// This increment opened the window (and set its expiry).
    pub first_in_window: bool,
    /// Time left in the window, when the store reports it.
    pub expires_in: Option<Duration>,
}

/// Abstract storage interface for shared fixed-window counters.
///
/// Any key-value store that can increment a key and expire it satisfies this trait,
/// as long as the expiry is set only by the increment that created the key and both
/// happen atomically (e.g. a server-side script). Implementations must not cache
/// counter values between calls.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Add `amount` to `key`; if the key did not exist, start a window of length `window`.
    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError>;
}

/// Expired windows are dropped on access once this many keys are held.
pub const DEFAULT_PURGE_THRESHOLD: usize = 10_000;

/// Simple in-memory counter store.
///
/// Useful for single-process deployments and tests. Windows expire lazily on access;
/// once the map holds `purge_threshold` keys an increment also drops every expired
/// window, and the next purge waits until the map has doubled from what survived.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    windows: Arc<Mutex<Windows>>,
    clock: Arc<dyn Clock>,
    purge_threshold: usize,
}

#[derive(Debug, Default)]
struct Windows {
    // key -> (count, expires_at_millis)
    counters: HashMap<String, (u64, u64)>,
    next_purge_at: usize,
}

impl Windows {
    fn purge(&mut self, now: u64) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, (_, expires_at)| *expires_at > now);
        before - self.counters.len()
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::with_clock(MonotonicClock::default())
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            windows: Arc::new(Mutex::new(Windows {
                counters: HashMap::new(),
                next_purge_at: DEFAULT_PURGE_THRESHOLD,
            })),
            clock: Arc::new(clock),
            purge_threshold: DEFAULT_PURGE_THRESHOLD,
        }
    }

    /// Override the key count that triggers a purge on access. Clamped to at least 1.
    pub fn with_purge_threshold(self, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        self.lock().next_purge_at = threshold;
        Self { purge_threshold: threshold, ..self }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().purge(now)
    }

    pub fn len(&self) -> usize {
        self.lock().counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();

        if guard.counters.len() >= guard.next_purge_at {
            let removed = guard.purge(now);
            guard.next_purge_at = guard.counters.len().saturating_mul(2).max(self.purge_threshold);
            tracing::debug!(
                target: "tollgate::store",
                removed,
                live = guard.counters.len(),
                "purged expired windows"
            );
        }

        let live = guard.counters.get(key).copied().filter(|(_, expires_at)| *expires_at > now);
        let (count, expires_at, first_in_window) = match live {
            Some((count, expires_at)) => (count.saturating_add(amount), expires_at, false),
            None => (amount, now.saturating_add(as_millis(window)), true),
        };
        guard.counters.insert(key.to_string(), (count, expires_at));

        Ok(CounterSnapshot {
            count,
            first_in_window,
            expires_in: Some(Duration::from_millis(expires_at - now)),
        })
    }
}
