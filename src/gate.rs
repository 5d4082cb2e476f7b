//! The admission gate: one call per request, one decision back.
//!
//! The gate resolves which tiers apply, charges each of them through the limiter its
//! tier's `store_mode` selects, and folds the results into a [`GateDecision`]. Store
//! outages are absorbed here according to each tier's [`FailurePolicy`]; the gate never
//! returns an error for a request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::GateConfig;
use crate::error::{ConfigError, StoreError};
use crate::rate_limit::key::RateLimitKey;
use crate::rate_limit::registry::LocalBucketRegistry;
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::strategies::{FixedWindowLimiter, TokenBucketLimiter};
use crate::rate_limit::tier::{FailurePolicy, StoreMode, TierConfig, TierName};
use crate::rate_limit::{Decision, RateLimiter};
use crate::resolver::{RequestContext, TierResolver};

/// Aggregate decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    /// True iff every evaluated limit allowed the request.
    pub allowed: bool,
    /// Remaining allowance of the most exhausted limit.
    pub remaining: u64,
    /// Present only when denied.
    pub retry_after_seconds: Option<u64>,
    /// Tier that decided the outcome: the denying tier, or the tightest one when allowed.
    pub limiting_tier: Option<TierName>,
    /// Capacity of the limiting tier.
    pub limit: u64,
    /// Refill interval (or window) of the limiting tier.
    pub window: Duration,
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Informational response headers, plus `Retry-After` on denial.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Window", self.window.as_secs().to_string()),
        ];
        if let Some(retry) = self.retry_after_seconds {
            headers.push(("Retry-After", retry.to_string()));
        }
        headers
    }

    /// Fold per-tier decisions.
    ///
    /// Denied if any decision denied; the denying tier is reported (ties broken toward
    /// the lowest remaining). `remaining` is always the minimum across all decisions.
    fn combine(evaluated: &[(&TierConfig, Decision)]) -> Self {
        let tightest = evaluated.iter().min_by_key(|(_, d)| (d.remaining, d.allowed));
        let Some((tightest_tier, tightest_decision)) = tightest else {
            return Self {
                allowed: true,
                remaining: u64::MAX,
                retry_after_seconds: None,
                limiting_tier: None,
                limit: u64::MAX,
                window: Duration::ZERO,
            };
        };
        let denied = evaluated.iter().filter(|(_, d)| !d.allowed).min_by_key(|(_, d)| d.remaining);
        let (tier, decision) = match denied {
            Some((tier, decision)) => (*tier, decision),
            None => (*tightest_tier, tightest_decision),
        };
        Self {
            allowed: decision.allowed,
            remaining: tightest_decision.remaining,
            retry_after_seconds: decision.retry_after_seconds,
            limiting_tier: Some(tier.name()),
            limit: tier.capacity(),
            window: tier.refill_interval(),
        }
    }
}

/// Builder for [`AdmissionGate`].
#[derive(Debug, Default)]
pub struct AdmissionGateBuilder {
    config: GateConfig,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AdmissionGateBuilder {
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Store backing tiers configured with `store_mode: SHARED`.
    pub fn shared_store<S: CounterStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn shared_store_arc(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock for local buckets (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Validate configuration and assemble the gate.
    ///
    /// Fails if any tier is invalid or missing, or if a tier is SHARED and no store was
    /// given.
    pub fn build(self) -> Result<AdmissionGate, ConfigError> {
        let tiers = Arc::new(self.config.validate()?);
        if self.store.is_none() {
            if let Some(tier) = tiers.iter().find(|t| t.store_mode() == StoreMode::Shared) {
                return Err(ConfigError::SharedStoreRequired(tier.name()));
            }
        }

        let full_refill = tiers
            .iter()
            .filter(|t| t.store_mode() == StoreMode::Local)
            .map(TierConfig::full_refill_time)
            .max()
            .unwrap_or_default();
        let max_idle = match self.config.idle_eviction() {
            Some(configured) => {
                if configured < full_refill {
                    warn!(
                        target: "tollgate::gate",
                        configured_s = configured.as_secs(),
                        full_refill_s = full_refill.as_secs(),
                        "idle eviction shorter than full refill; evicted callers regain a full bucket early"
                    );
                }
                configured
            }
            None => full_refill,
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let local = TokenBucketLimiter::new(LocalBucketRegistry::with_shared_clock(clock));
        let shared = self.store.map(|store| {
            FixedWindowLimiter::new(store).with_timeout(self.config.shared_store_timeout())
        });
        let resolver = TierResolver::new(tiers, self.config.route_table())
            .trust_forwarded_for(self.config.trust_forwarded_for);

        info!(
            target: "tollgate::gate",
            shared_store = shared.is_some(),
            max_idle_s = max_idle.as_secs(),
            "admission gate ready"
        );
        Ok(AdmissionGate { resolver, local, shared, max_idle })
    }
}

/// Per-request admission control façade.
///
/// Owns its bucket registry; build one gate per process (or per test) and share it
/// behind an `Arc`.
#[derive(Debug)]
pub struct AdmissionGate {
    resolver: TierResolver,
    local: TokenBucketLimiter,
    shared: Option<FixedWindowLimiter>,
    max_idle: Duration,
}

impl AdmissionGate {
    pub fn builder() -> AdmissionGateBuilder {
        AdmissionGateBuilder::default()
    }

    /// Gate with the built-in tiers and process-local buckets only.
    pub fn local_default() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    pub fn resolver(&self) -> &TierResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &LocalBucketRegistry {
        self.local.registry()
    }

    /// Evaluate one unit-cost request.
    pub async fn evaluate(&self, ctx: &RequestContext) -> GateDecision {
        self.evaluate_cost(ctx, 1).await
    }

    /// Evaluate a request costing `cost` units against every applicable tier.
    ///
    /// Stops at the first denial; tiers after it are not charged. Tiers already charged
    /// stay charged, whatever happens to the request afterwards.
    pub async fn evaluate_cost(&self, ctx: &RequestContext, cost: u64) -> GateDecision {
        let limits = self.resolver.resolve(ctx);
        let mut evaluated = Vec::with_capacity(limits.len());
        for (key, tier) in limits {
            let decision = self.check(&key, tier, cost).await;
            let allowed = decision.allowed;
            evaluated.push((tier, decision));
            if !allowed {
                debug!(
                    target: "tollgate::gate",
                    key = %key,
                    tier = %tier.name(),
                    retry_after_s = ?decision.retry_after_seconds,
                    "request denied"
                );
                break;
            }
        }
        GateDecision::combine(&evaluated)
    }

    async fn check(&self, key: &RateLimitKey, tier: &TierConfig, cost: u64) -> Decision {
        match (tier.store_mode(), &self.shared) {
            (StoreMode::Shared, Some(shared)) => match shared.check(key, tier, cost).await {
                Ok(decision) => decision,
                Err(err) => Self::on_store_failure(key, tier, &err),
            },
            _ => self.local.consume(key, tier, cost),
        }
    }

    fn on_store_failure(key: &RateLimitKey, tier: &TierConfig, err: &StoreError) -> Decision {
        match tier.failure_policy() {
            FailurePolicy::FailOpen => {
                warn!(
                    target: "tollgate::gate",
                    key = %key,
                    tier = %tier.name(),
                    error = %err,
                    "counter store unavailable; failing open"
                );
                Decision::allowed(tier.capacity())
            }
            FailurePolicy::FailClosed => {
                error!(
                    target: "tollgate::gate",
                    key = %key,
                    tier = %tier.name(),
                    error = %err,
                    "counter store unavailable; failing closed"
                );
                Decision::denied(0, tier.refill_interval())
            }
        }
    }

    /// Evict idle local buckets. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let removed = self.local.registry().sweep(self.max_idle);
        if removed > 0 {
            info!(
                target: "tollgate::gate",
                removed,
                live = self.local.registry().len(),
                "evicted idle buckets"
            );
        }
        removed
    }

    /// Sweep every `period`, forever. Spawn it on the host runtime if eviction is wanted.
    pub async fn run_sweeper(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep();
        }
    }
}
