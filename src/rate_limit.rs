//! Rate limiting primitives.
//!
//! This module provides the building blocks the [`AdmissionGate`](crate::AdmissionGate)
//! is assembled from:
//! - [`RateLimitKey`]: what is being throttled.
//! - [`TierConfig`]: how much of it is allowed.
//! - [`Decision`]: the result of a single limiter check (allowed / denied).
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `AdmissionLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask the gate.
//! - **Logic**: `TokenBucketLimiter` and `FixedWindowLimiter` (in `strategies`) handle the math.
//! - **Storage**: `LocalBucketRegistry` (in `registry`) holds process-local buckets,
//!   `CounterStore` (in `store`) abstracts a shared backend (e.g., Redis).

use std::time::Duration;

pub mod bucket;
pub mod key;
pub mod middleware;
pub mod registry;
pub mod store;
pub mod strategies;
pub mod tier;

pub use key::{RateLimitKey, SubjectKind};
pub use middleware::{AdmissionLayer, AdmissionService, AdmittedHook, NoHook};
pub use registry::LocalBucketRegistry;
pub use store::{CounterSnapshot, CounterStore, InMemoryCounterStore};
pub use strategies::{FixedWindowLimiter, TokenBucketLimiter};
pub use tier::{FailurePolicy, RefillMode, StoreMode, TierConfig, TierName};

/// The decision returned by a single limiter check.
///
/// Created once per evaluation and never cached across requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the unit of work may proceed.
    pub allowed: bool,
    /// Whole tokens (or window slots) left after this check.
    /// Useful for `X-RateLimit-Remaining` headers.
    pub remaining: u64,
    /// Seconds the caller should wait; present only when denied.
    /// Useful for `Retry-After` headers.
    pub retry_after_seconds: Option<u64>,
}

impl Decision {
    /// An allowing decision.
    pub fn allowed(remaining: u64) -> Self {
        Self { allowed: true, remaining, retry_after_seconds: None }
    }

    /// A denying decision with a retry hint, rounded up to whole seconds (minimum 1).
    pub fn denied(remaining: u64, retry_after: Duration) -> Self {
        Self { allowed: false, remaining, retry_after_seconds: Some(ceil_secs(retry_after)) }
    }

    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Core interface for limiter algorithms.
///
/// This trait decouples the gate from the algorithm (token bucket, fixed window) and
/// the storage behind it (process memory, Redis).
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Charge `cost` units against `key` under `tier`.
    ///
    /// Errors only when a backing store cannot answer; the caller decides whether that
    /// means allow or deny.
    async fn check(
        &self,
        key: &RateLimitKey,
        tier: &TierConfig,
        cost: u64,
    ) -> Result<Decision, crate::error::StoreError>;
}

/// Round a duration up to whole seconds, never below one.
pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

/// Duration as whole milliseconds, saturating.
pub(crate) fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
