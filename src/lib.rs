#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Admission control for request pipelines: decide per request whether to let it
//! through or reject it with a retry hint, based on tiered consumption limits tied to
//! caller identity.
//!
//! ## Features
//!
//! - **Token buckets** with lazy refill, one lock per key, no background timers
//! - **Shared fixed-window counters** for limits enforced across many instances
//! - **Tiers** for anonymous, authenticated, login, admin and premium callers
//! - **Fail-open / fail-closed** handling of shared store outages per tier
//! - **Tower middleware** that rejects before the inner service runs
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{AdmissionGate, RequestContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     let gate = AdmissionGate::local_default().expect("valid built-in tiers");
//!     let ctx = RequestContext::new("203.0.113.9".parse().unwrap(), "/students")
//!         .with_username("alice");
//!
//!     let decision = gate.evaluate(&ctx).await;
//!     if !decision.allowed {
//!         // reply 429 with decision.retry_after_seconds
//!     }
//!     for (name, value) in decision.headers() {
//!         let _ = (name, value);
//!     }
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod prelude;
pub mod rate_limit;
pub mod resolver;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{GateConfig, TierRecord};
pub use error::{AdmissionError, ConfigError, StoreError};
pub use gate::{AdmissionGate, AdmissionGateBuilder, GateDecision};
pub use rate_limit::{
    AdmissionLayer, AdmissionService, AdmittedHook, CounterSnapshot, CounterStore, Decision,
    FailurePolicy, InMemoryCounterStore, LocalBucketRegistry, NoHook, RateLimitKey, RateLimiter,
    RefillMode, StoreMode, SubjectKind, TierConfig, TierName,
};
pub use resolver::{ClientAddress, Plan, RequestContext, RouteClass, RouteRule, RouteTable, TierResolver};
