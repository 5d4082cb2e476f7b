//! Convenient re-exports for common Tollgate types.
pub use crate::{
    config::{GateConfig, TierRecord},
    error::{AdmissionError, ConfigError, StoreError},
    gate::{AdmissionGate, GateDecision},
    rate_limit::{
        tier::TierTable, AdmissionLayer, CounterStore, Decision, FailurePolicy, RateLimitKey,
        RefillMode, StoreMode, TierConfig, TierName,
    },
    resolver::{Plan, RequestContext, RouteClass, RouteTable},
};
