//! Per-key token bucket state and the refill-then-consume step.
//!
//! Refill is lazy: nothing runs in the background, tokens are credited from the time
//! elapsed since `last_refill` whenever the bucket is touched. Token counts are whole
//! numbers because refill is always credited in whole tokens.

use std::time::Duration;

use crate::rate_limit::tier::{RefillMode, TierConfig};
use crate::rate_limit::Decision;

/// Mutable bucket record. Owned by the registry and only mutated under its per-key lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    tokens: u64,
    last_refill_millis: u64,
}

impl BucketState {
    /// A full bucket: the first burst is never throttled.
    pub fn full(tier: &TierConfig, now_millis: u64) -> Self {
        Self { tokens: tier.capacity(), last_refill_millis: now_millis }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn last_refill_millis(&self) -> u64 {
        self.last_refill_millis
    }

    /// Credit whole tokens for the time elapsed since the last refill.
    ///
    /// `last_refill` only ever moves by the time the credited tokens account for, so
    /// partial progress toward the next token is kept. A clock reading earlier than
    /// `last_refill` counts as zero elapsed time. The balance never exceeds `tier`'s
    /// capacity afterwards, even if the bucket was filled under a larger tier.
    pub fn refill(&mut self, tier: &TierConfig, now_millis: u64) {
        self.tokens = self.tokens.min(tier.capacity());
        let elapsed = u128::from(now_millis.saturating_sub(self.last_refill_millis));
        let interval = u128::from(tier.refill_interval_millis());
        let per_interval = u128::from(tier.refill_tokens());

        let (added, advance) = match tier.refill_mode() {
            RefillMode::Intervally => {
                let steps = elapsed / interval;
                (steps * per_interval, steps * interval)
            }
            RefillMode::Greedy => {
                let added = elapsed * per_interval / interval;
                // Rounded up so the bucket never runs ahead of the configured rate.
                (added, (added * interval).div_ceil(per_interval))
            }
        };
        if added == 0 {
            return;
        }
        let capacity = u128::from(tier.capacity());
        self.tokens = clamp_u64((u128::from(self.tokens) + added).min(capacity));
        self.last_refill_millis = self.last_refill_millis.saturating_add(clamp_u64(advance));
    }

    /// Refill, then take `cost` tokens if available.
    pub fn try_consume(&mut self, tier: &TierConfig, cost: u64, now_millis: u64) -> Decision {
        self.refill(tier, now_millis);
        if self.tokens >= cost {
            self.tokens -= cost;
            return Decision::allowed(self.tokens);
        }
        let deficit = cost - self.tokens;
        Decision::denied(self.tokens, wait_for(tier, deficit))
    }
}

/// Time until `deficit` more tokens have been credited.
fn wait_for(tier: &TierConfig, deficit: u64) -> Duration {
    let interval = u128::from(tier.refill_interval_millis());
    let per_interval = u128::from(tier.refill_tokens());
    let deficit = u128::from(deficit);
    let millis = match tier.refill_mode() {
        RefillMode::Intervally => deficit.div_ceil(per_interval) * interval,
        RefillMode::Greedy => (deficit * interval).div_ceil(per_interval),
    };
    Duration::from_millis(clamp_u64(millis))
}

fn clamp_u64(v: u128) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::tier::TierName;

    fn tier(capacity: u64, refill: u64, secs: u64, mode: RefillMode) -> TierConfig {
        TierConfig::new(TierName::Anonymous, capacity, refill, Duration::from_secs(secs))
            .unwrap()
            .with_refill_mode(mode)
    }

    #[test]
    fn burst_then_deny_with_greedy_hint() {
        let t = tier(15, 10, 60, RefillMode::Greedy);
        let mut b = BucketState::full(&t, 0);
        for i in 0..15 {
            let d = b.try_consume(&t, 1, 0);
            assert!(d.allowed, "request {} should pass", i + 1);
            assert_eq!(d.remaining, 14 - i);
        }
        let d = b.try_consume(&t, 1, 0);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.retry_after_seconds, Some(6));
    }

    #[test]
    fn intervally_hint_is_whole_intervals() {
        let t = tier(15, 10, 60, RefillMode::Intervally);
        let mut b = BucketState::full(&t, 0);
        for _ in 0..15 {
            b.try_consume(&t, 1, 0);
        }
        let d = b.try_consume(&t, 1, 0);
        assert_eq!(d.retry_after_seconds, Some(60));
        let d = b.try_consume(&t, 11, 0);
        assert_eq!(d.retry_after_seconds, Some(120));
    }

    #[test]
    fn intervally_refills_in_whole_steps() {
        let t = tier(15, 10, 60, RefillMode::Intervally);
        let mut b = BucketState { tokens: 0, last_refill_millis: 0 };
        b.refill(&t, 59_999);
        assert_eq!(b.tokens(), 0);
        b.refill(&t, 90_000);
        assert_eq!(b.tokens(), 10);
        // the half interval already elapsed is kept
        assert_eq!(b.last_refill_millis(), 60_000);
        b.refill(&t, 120_000);
        assert_eq!(b.tokens(), 15);
    }

    #[test]
    fn greedy_keeps_partial_progress() {
        let t = tier(15, 10, 60, RefillMode::Greedy);
        let mut b = BucketState { tokens: 0, last_refill_millis: 0 };
        b.refill(&t, 9_000);
        assert_eq!(b.tokens(), 1);
        assert_eq!(b.last_refill_millis(), 6_000);
        b.refill(&t, 12_000);
        assert_eq!(b.tokens(), 2);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        for mode in [RefillMode::Greedy, RefillMode::Intervally] {
            let t = tier(15, 10, 60, mode);
            let mut b = BucketState { tokens: 3, last_refill_millis: 0 };
            b.refill(&t, 10 * 3_600_000);
            assert_eq!(b.tokens(), 15);
        }
    }

    #[test]
    fn waiting_one_interval_restores_refill_tokens() {
        for mode in [RefillMode::Greedy, RefillMode::Intervally] {
            let t = tier(15, 10, 60, mode);
            let mut b = BucketState::full(&t, 0);
            while b.try_consume(&t, 1, 0).allowed {}
            let mut admitted = 0;
            while b.try_consume(&t, 1, 60_000).allowed {
                admitted += 1;
            }
            assert!(admitted >= 10, "{:?} admitted {}", mode, admitted);
            assert!(admitted <= 15);
        }
    }

    #[test]
    fn clock_moving_backward_credits_nothing() {
        let t = tier(5, 1, 1, RefillMode::Greedy);
        let mut b = BucketState::full(&t, 100_000);
        b.try_consume(&t, 3, 100_000);
        let before = b.tokens();
        let d = b.try_consume(&t, 1, 40_000);
        assert!(d.remaining < before);
        assert_eq!(b.last_refill_millis(), 100_000);
    }

    #[test]
    fn tokens_never_go_negative() {
        let t = tier(3, 1, 1, RefillMode::Greedy);
        let mut b = BucketState::full(&t, 0);
        for cost in [2, 2, 5, 1, 1, 1, 3] {
            let d = b.try_consume(&t, cost, 0);
            assert!(d.remaining <= 3);
            assert_eq!(d.remaining, b.tokens());
        }
    }

    #[test]
    fn smaller_tier_clamps_balance_left_by_larger_one() {
        let big = TierConfig::builtin(TierName::Premium);
        let small = tier(15, 10, 60, RefillMode::Greedy);
        let mut b = BucketState::full(&big, 0);
        b.try_consume(&big, 2, 0);

        let d = b.try_consume(&small, 1, 0);
        assert!(d.allowed);
        assert_eq!(d.remaining, 14);
        let mut admitted = 1;
        while b.try_consume(&small, 1, 0).allowed {
            admitted += 1;
        }
        assert_eq!(admitted, 15);
        assert_eq!(b.tokens(), 0);
    }

    #[test]
    fn premium_tier_refills_without_overflow() {
        let t = TierConfig::builtin(TierName::Premium);
        let mut b = BucketState { tokens: 0, last_refill_millis: 0 };
        b.refill(&t, u64::MAX);
        assert_eq!(b.tokens(), t.capacity());
    }
}
