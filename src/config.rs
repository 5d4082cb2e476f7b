//! Startup configuration.
//!
//! One [`TierRecord`] per tier, loaded once and validated into an immutable
//! [`TierTable`]. Anything missing or out of range is a [`ConfigError`] and must stop
//! the service from serving traffic.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::rate_limit::tier::{
    FailurePolicy, RefillMode, StoreMode, TierConfig, TierName, TierTable,
};
use crate::rate_limit::strategies::DEFAULT_STORE_TIMEOUT;
use crate::resolver::{RouteRule, RouteTable};

/// Wire form of one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierRecord {
    pub tier_name: TierName,
    pub capacity: u64,
    pub refill_tokens: u64,
    pub refill_interval_seconds: u64,
    #[serde(default)]
    pub store_mode: StoreMode,
    /// Defaults to the tier's own policy (fail-closed for LOGIN and ADMIN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub refill: RefillMode,
}

impl TierRecord {
    /// Validate into a [`TierConfig`].
    pub fn to_config(&self) -> Result<TierConfig, ConfigError> {
        let config = TierConfig::new(
            self.tier_name,
            self.capacity,
            self.refill_tokens,
            Duration::from_secs(self.refill_interval_seconds),
        )?
        .with_store_mode(self.store_mode)
        .with_refill_mode(self.refill)
        .with_failure_policy(
            self.failure_policy.unwrap_or_else(|| self.tier_name.default_failure_policy()),
        );
        Ok(config)
    }
}

impl From<&TierConfig> for TierRecord {
    fn from(config: &TierConfig) -> Self {
        Self {
            tier_name: config.name(),
            capacity: config.capacity(),
            refill_tokens: config.refill_tokens(),
            refill_interval_seconds: config.refill_interval().as_secs(),
            store_mode: config.store_mode(),
            failure_policy: Some(config.failure_policy()),
            refill: config.refill_mode(),
        }
    }
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT.as_millis() as u64
}

/// Full gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Exactly one record per tier.
    pub tiers: Vec<TierRecord>,
    /// Budget for one shared store round-trip.
    #[serde(default = "default_store_timeout_ms")]
    pub shared_store_timeout_ms: u64,
    /// Idle time after which local buckets may be evicted. Defaults to the longest
    /// full-refill time among local tiers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_eviction_seconds: Option<u64>,
    /// Take the caller address from `X-Forwarded-For`.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Route classification table, first match wins.
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            tiers: TierTable::default().iter().map(TierRecord::from).collect(),
            shared_store_timeout_ms: default_store_timeout_ms(),
            idle_eviction_seconds: None,
            trust_forwarded_for: false,
            routes: Vec::new(),
        }
    }
}

impl GateConfig {
    /// Parse a JSON document. Values are not validated until [`GateConfig::validate`].
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Validate every record and build the tier table.
    pub fn validate(&self) -> Result<TierTable, ConfigError> {
        if self.shared_store_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        let configs = self.tiers.iter().map(TierRecord::to_config).collect::<Result<Vec<_>, _>>()?;
        let table = TierTable::new(configs)?;
        for tier in table.iter() {
            info!(
                target: "tollgate::config",
                tier = %tier.name(),
                capacity = tier.capacity(),
                refill_tokens = tier.refill_tokens(),
                refill_interval_s = tier.refill_interval().as_secs_f64(),
                store_mode = ?tier.store_mode(),
                failure_policy = ?tier.failure_policy(),
                "tier configured"
            );
        }
        Ok(table)
    }

    pub fn shared_store_timeout(&self) -> Duration {
        Duration::from_millis(self.shared_store_timeout_ms)
    }

    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_seconds.map(Duration::from_secs)
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::from_rules(self.routes.iter().cloned())
    }

    /// Replace the record for one tier.
    pub fn set_tier(&mut self, record: TierRecord) {
        self.tiers.retain(|r| r.tier_name != record.tier_name);
        self.tiers.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::RouteClass;

    const FULL: &str = r#"{
        "tiers": [
            {"tier_name": "ANONYMOUS", "capacity": 15, "refill_tokens": 10, "refill_interval_seconds": 60},
            {"tier_name": "USER", "capacity": 100, "refill_tokens": 100, "refill_interval_seconds": 60, "store_mode": "SHARED"},
            {"tier_name": "LOGIN", "capacity": 5, "refill_tokens": 1, "refill_interval_seconds": 60, "refill": "INTERVALLY"},
            {"tier_name": "ADMIN", "capacity": 30, "refill_tokens": 30, "refill_interval_seconds": 60, "failure_policy": "FAIL_OPEN"},
            {"tier_name": "PREMIUM", "capacity": 1000000, "refill_tokens": 1000000, "refill_interval_seconds": 1}
        ],
        "shared_store_timeout_ms": 25,
        "routes": [{"prefix": "/login", "class": "LOGIN"}]
    }"#;

    #[test]
    fn parses_and_validates_full_document() {
        let cfg = GateConfig::from_json_str(FULL).unwrap();
        let table = cfg.validate().unwrap();
        assert_eq!(table.get(TierName::User).store_mode(), StoreMode::Shared);
        assert_eq!(table.get(TierName::Login).refill_mode(), RefillMode::Intervally);
        assert_eq!(table.get(TierName::Login).failure_policy(), FailurePolicy::FailClosed);
        assert_eq!(table.get(TierName::Admin).failure_policy(), FailurePolicy::FailOpen);
        assert_eq!(cfg.shared_store_timeout(), Duration::from_millis(25));
        assert_eq!(cfg.route_table().classify("/login"), RouteClass::Login);
    }

    #[test]
    fn missing_tier_is_fatal() {
        let mut cfg = GateConfig::default();
        cfg.tiers.retain(|r| r.tier_name != TierName::Premium);
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingTier(TierName::Premium))));
    }

    #[test]
    fn invalid_values_are_fatal() {
        let mut cfg = GateConfig::default();
        cfg.set_tier(TierRecord {
            tier_name: TierName::Login,
            capacity: 5,
            refill_tokens: 5,
            refill_interval_seconds: 0,
            store_mode: StoreMode::Local,
            failure_policy: None,
            refill: RefillMode::Greedy,
        });
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidRefillInterval { .. })));
    }

    #[test]
    fn zero_timeout_is_fatal() {
        let cfg = GateConfig { shared_store_timeout_ms: 0, ..GateConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTimeout)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{"tiers": [], "burst": 5}"#;
        assert!(matches!(GateConfig::from_json_str(raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn default_round_trips_through_json() {
        let cfg = GateConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(GateConfig::from_json_str(&json).unwrap(), cfg);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = GateConfig::from_json_file("/nonexistent/tollgate.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
