//! Error types for admission control.
//!
//! Only [`ConfigError`] is ever returned to the host at startup. Store failures
//! are absorbed by the gate according to each tier's failure policy, and the
//! middleware reports denials through [`AdmissionError`].
use std::fmt;
use std::time::Duration;

use crate::gate::GateDecision;
use crate::rate_limit::tier::TierName;

/// Invalid or incomplete tier configuration. Fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// One of the five built-in tiers has no record.
    #[error("tier {0} is not configured")]
    MissingTier(TierName),
    /// The same tier was configured twice.
    #[error("tier {0} is configured more than once")]
    DuplicateTier(TierName),
    /// Capacity must be >= 1.
    #[error("tier {tier}: capacity must be >= 1 (got {provided})")]
    InvalidCapacity {
        /// Offending tier.
        tier: TierName,
        /// Value provided by caller.
        provided: u64,
    },
    /// Refill tokens must be >= 1.
    #[error("tier {tier}: refill_tokens must be >= 1 (got {provided})")]
    InvalidRefillTokens {
        /// Offending tier.
        tier: TierName,
        /// Value provided by caller.
        provided: u64,
    },
    /// Refill tokens may not exceed capacity.
    #[error("tier {tier}: refill_tokens ({refill_tokens}) exceeds capacity ({capacity})")]
    RefillExceedsCapacity {
        /// Offending tier.
        tier: TierName,
        /// Configured capacity.
        capacity: u64,
        /// Configured refill tokens.
        refill_tokens: u64,
    },
    /// Refill interval must be non-zero and representable in milliseconds.
    #[error("tier {tier}: refill_interval must be > 0 (got {provided:?})")]
    InvalidRefillInterval {
        /// Offending tier.
        tier: TierName,
        /// Value provided by caller.
        provided: Duration,
    },
    /// A tier uses the shared store but no store was supplied to the gate.
    #[error("tier {0} uses store_mode SHARED but no shared counter store was provided")]
    SharedStoreRequired(TierName),
    /// Shared store timeout must be non-zero.
    #[error("shared_store_timeout must be > 0")]
    InvalidTimeout,
    /// Configuration document could not be decoded.
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    /// Configuration file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure talking to the shared counter store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backing store unreachable or returned an error.
    #[error("counter store unavailable for key '{key}': {message}")]
    Unavailable {
        /// Key being incremented.
        key: String,
        /// Backend error text.
        message: String,
    },
    /// The round-trip exceeded the adapter's budget.
    #[error("counter store timed out after {timeout:?} for key '{key}'")]
    Timeout {
        /// Key being incremented.
        key: String,
        /// Configured timeout.
        timeout: Duration,
    },
    /// Backing store replied with something the adapter cannot interpret.
    #[error("unexpected counter store reply: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Check if this error is due to the adapter timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error produced by [`crate::rate_limit::AdmissionService`].
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The gate denied the request; the decision carries the retry hint.
    Rejected(GateDecision),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(decision) => {
                let tier = decision
                    .limiting_tier
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                write!(
                    f,
                    "too many requests (tier {}, retry after {}s)",
                    tier,
                    decision.retry_after_seconds.unwrap_or(0)
                )
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if the gate rejected the request.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
    /// Borrow the gate decision for a rejection.
    pub fn decision(&self) -> Option<&GateDecision> {
        match self {
            Self::Rejected(d) => Some(d),
            Self::Inner(_) => None,
        }
    }
    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}
