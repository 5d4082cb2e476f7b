use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tollgate::{
    AdmissionGate, CounterSnapshot, CounterStore, FailurePolicy, GateConfig, InMemoryCounterStore,
    ManualClock, RequestContext, RouteClass, StoreError, StoreMode, TierName,
};

fn ip(raw: &str) -> IpAddr {
    raw.parse().unwrap()
}

/// Store that is always down.
#[derive(Debug, Default)]
struct DownStore {
    calls: AtomicUsize,
}

#[async_trait]
impl CounterStore for DownStore {
    async fn increment_and_get(
        &self,
        key: &str,
        _amount: u64,
        _window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable { key: key.to_string(), message: "connection refused".into() })
    }
}

/// Forwards to a shared in-memory store, standing in for one service instance.
#[derive(Debug, Clone)]
struct Instance(Arc<InMemoryCounterStore>);

#[async_trait]
impl CounterStore for Instance {
    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        self.0.increment_and_get(key, amount, window).await
    }
}

fn all_shared(policy: Option<FailurePolicy>) -> GateConfig {
    let mut config = GateConfig::default();
    for record in &mut config.tiers {
        record.store_mode = StoreMode::Shared;
        if policy.is_some() {
            record.failure_policy = policy;
        }
    }
    config
}

#[tokio::test]
async fn fail_open_tier_allows_when_store_is_down() {
    let gate = AdmissionGate::builder()
        .config(all_shared(Some(FailurePolicy::FailOpen)))
        .shared_store(DownStore::default())
        .build()
        .unwrap();
    let d = gate.evaluate(&RequestContext::new(ip("192.0.2.1"), "/")).await;
    assert!(d.allowed);
    assert!(d.retry_after_seconds.is_none());
}

#[tokio::test]
async fn fail_closed_tier_denies_when_store_is_down() {
    let gate = AdmissionGate::builder()
        .config(all_shared(Some(FailurePolicy::FailClosed)))
        .shared_store(DownStore::default())
        .build()
        .unwrap();
    let d = gate.evaluate(&RequestContext::new(ip("192.0.2.1"), "/")).await;
    assert!(!d.allowed);
    assert_eq!(d.limiting_tier, Some(TierName::Anonymous));
    assert_eq!(d.retry_after_seconds, Some(60));
}

#[tokio::test]
async fn default_policies_fail_closed_only_for_login_and_admin() {
    let store = Arc::new(DownStore::default());
    let gate = AdmissionGate::builder()
        .config(all_shared(None))
        .shared_store_arc(store.clone())
        .build()
        .unwrap();

    let browse = RequestContext::new(ip("192.0.2.2"), "/").with_username("alice");
    assert!(gate.evaluate(&browse).await.allowed);

    let login = RequestContext::new(ip("192.0.2.2"), "/")
        .with_route_class(RouteClass::Login)
        .with_login_target("alice");
    let d = gate.evaluate(&login).await;
    assert!(!d.allowed);
    assert_eq!(d.limiting_tier, Some(TierName::Login));

    let admin = RequestContext::new(ip("192.0.2.2"), "/").with_route_class(RouteClass::Admin);
    let d = gate.evaluate(&admin).await;
    assert!(!d.allowed);
    assert_eq!(d.limiting_tier, Some(TierName::Admin));

    // browse: ip + user, login: ip + login (stopped there), admin: ip + admin
    assert_eq!(store.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn instances_sharing_a_store_share_one_limit() {
    let clock = ManualClock::new(0);
    let backing = Arc::new(InMemoryCounterStore::with_clock(clock.clone()));
    let mut config = GateConfig::default();
    for record in &mut config.tiers {
        if record.tier_name == TierName::Anonymous {
            record.store_mode = StoreMode::Shared;
            record.capacity = 4;
            record.refill_tokens = 4;
        }
    }
    let a = AdmissionGate::builder()
        .config(config.clone())
        .shared_store(Instance(backing.clone()))
        .build()
        .unwrap();
    let b = AdmissionGate::builder().config(config).shared_store(Instance(backing)).build().unwrap();
    let ctx = RequestContext::new(ip("198.51.100.20"), "/");

    assert!(a.evaluate(&ctx).await.allowed);
    assert!(b.evaluate(&ctx).await.allowed);
    assert!(a.evaluate(&ctx).await.allowed);
    let last = b.evaluate(&ctx).await;
    assert!(last.allowed);
    assert_eq!(last.remaining, 0);

    clock.advance(Duration::from_secs(15));
    let denied = a.evaluate(&ctx).await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after_seconds, Some(45));
    assert!(a.registry().is_empty(), "shared tiers never touch local buckets");

    clock.advance(Duration::from_secs(45));
    assert!(b.evaluate(&ctx).await.allowed);
}
