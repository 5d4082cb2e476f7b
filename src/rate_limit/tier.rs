//! Tier configuration: named (capacity, refill) pairs applied to a class of caller or route.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rate_limit::as_millis;

/// The five built-in tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierName {
    /// Every caller, keyed by address.
    Anonymous,
    /// Authenticated callers, keyed by username.
    User,
    /// Credential checks, keyed by the attempted identity.
    Login,
    /// Administrative routes, keyed by caller.
    Admin,
    /// Premium plans; modelled as a very large bucket.
    Premium,
}

impl TierName {
    /// All tiers, in resolution order.
    pub const ALL: [TierName; 5] =
        [TierName::Anonymous, TierName::User, TierName::Login, TierName::Admin, TierName::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Anonymous => "ANONYMOUS",
            TierName::User => "USER",
            TierName::Login => "LOGIN",
            TierName::Admin => "ADMIN",
            TierName::Premium => "PREMIUM",
        }
    }

    /// Security-critical tiers deny on store outages; everything else lets traffic through.
    pub fn default_failure_policy(&self) -> FailurePolicy {
        match self {
            TierName::Login | TierName::Admin => FailurePolicy::FailClosed,
            _ => FailurePolicy::FailOpen,
        }
    }

    fn index(&self) -> usize {
        match self {
            TierName::Anonymous => 0,
            TierName::User => 1,
            TierName::Login => 2,
            TierName::Admin => 3,
            TierName::Premium => 4,
        }
    }
}

impl fmt::Display for TierName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a tier keeps its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreMode {
    /// Process-local token bucket.
    #[default]
    Local,
    /// Fixed-window counter in a store shared by every instance.
    Shared,
}

/// What to do when the shared store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// Treat as allowed and log loudly.
    FailOpen,
    /// Treat as denied.
    FailClosed,
}

/// How tokens come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefillMode {
    /// One token at a time, every `refill_interval / refill_tokens`.
    #[default]
    Greedy,
    /// `refill_tokens` at once, every full `refill_interval`.
    Intervally,
}

/// Validated, immutable tier configuration.
///
/// Invariant: `capacity >= refill_tokens >= 1` and `refill_interval >= 1ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierConfig {
    name: TierName,
    capacity: u64,
    refill_tokens: u64,
    refill_interval: Duration,
    refill_mode: RefillMode,
    store_mode: StoreMode,
    failure_policy: FailurePolicy,
}

impl TierConfig {
    /// Create a config with validation. Store mode defaults to local, refill to greedy and
    /// the failure policy to the tier's default.
    pub fn new(
        name: TierName,
        capacity: u64,
        refill_tokens: u64,
        refill_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity { tier: name, provided: capacity });
        }
        if refill_tokens == 0 {
            return Err(ConfigError::InvalidRefillTokens { tier: name, provided: refill_tokens });
        }
        if refill_tokens > capacity {
            return Err(ConfigError::RefillExceedsCapacity { tier: name, capacity, refill_tokens });
        }
        if as_millis(refill_interval) == 0 {
            return Err(ConfigError::InvalidRefillInterval { tier: name, provided: refill_interval });
        }
        Ok(Self {
            name,
            capacity,
            refill_tokens,
            refill_interval,
            refill_mode: RefillMode::default(),
            store_mode: StoreMode::default(),
            failure_policy: name.default_failure_policy(),
        })
    }

    /// Built-in defaults for each tier.
    pub fn builtin(name: TierName) -> Self {
        let (capacity, refill_tokens, secs) = match name {
            TierName::Anonymous => (15, 10, 60),
            TierName::User => (120, 100, 60),
            TierName::Login => (5, 5, 300),
            TierName::Admin => (30, 30, 60),
            TierName::Premium => (1_000_000, 1_000_000, 1),
        };
        Self {
            name,
            capacity,
            refill_tokens,
            refill_interval: Duration::from_secs(secs),
            refill_mode: RefillMode::default(),
            store_mode: StoreMode::default(),
            failure_policy: name.default_failure_policy(),
        }
    }

    pub fn with_store_mode(mut self, mode: StoreMode) -> Self {
        self.store_mode = mode;
        self
    }

    pub fn with_refill_mode(mut self, mode: RefillMode) -> Self {
        self.refill_mode = mode;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn name(&self) -> TierName {
        self.name
    }

    /// Maximum burst.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per interval.
    pub fn refill_tokens(&self) -> u64 {
        self.refill_tokens
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub(crate) fn refill_interval_millis(&self) -> u64 {
        as_millis(self.refill_interval)
    }

    pub fn refill_mode(&self) -> RefillMode {
        self.refill_mode
    }

    pub fn store_mode(&self) -> StoreMode {
        self.store_mode
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Time for an empty bucket to become full again.
    pub fn full_refill_time(&self) -> Duration {
        let steps = self.capacity.div_ceil(self.refill_tokens);
        let steps = u32::try_from(steps).unwrap_or(u32::MAX);
        self.refill_interval.saturating_mul(steps)
    }
}

/// Exactly one validated [`TierConfig`] per [`TierName`].
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: [TierConfig; 5],
}

impl TierTable {
    /// Build a table, rejecting missing or duplicated tiers.
    pub fn new(configs: impl IntoIterator<Item = TierConfig>) -> Result<Self, ConfigError> {
        let mut slots: [Option<TierConfig>; 5] = Default::default();
        for cfg in configs {
            let slot = &mut slots[cfg.name.index()];
            if slot.is_some() {
                return Err(ConfigError::DuplicateTier(cfg.name));
            }
            *slot = Some(cfg);
        }
        let [a, u, l, ad, p] = slots;
        Ok(Self {
            tiers: [
                a.ok_or(ConfigError::MissingTier(TierName::Anonymous))?,
                u.ok_or(ConfigError::MissingTier(TierName::User))?,
                l.ok_or(ConfigError::MissingTier(TierName::Login))?,
                ad.ok_or(ConfigError::MissingTier(TierName::Admin))?,
                p.ok_or(ConfigError::MissingTier(TierName::Premium))?,
            ],
        })
    }

    pub fn get(&self, name: TierName) -> &TierConfig {
        &self.tiers[name.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TierConfig> {
        self.tiers.iter()
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self { tiers: TierName::ALL.map(TierConfig::builtin) }
    }
}
