use std::time::Duration;

use tollgate::CounterStore;
use tollgate_redis::RedisCounterStore;

// Requires Redis running. If TOLLGATE_TEST_REDIS_URL is unset, the test skips.
async fn store() -> Option<RedisCounterStore> {
    let url = match std::env::var("TOLLGATE_TEST_REDIS_URL") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("skipping: set TOLLGATE_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379)");
            return None;
        }
    };
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let store = RedisCounterStore::open(&url)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to redis at '{}': {}", url, e))
        .with_key_prefix(format!("tollgate-test:{}:", nanos));
    Some(store)
}

#[tokio::test]
async fn counts_within_one_window() {
    let Some(store) = store().await else { return };
    let window = Duration::from_secs(30);

    let first = store.increment_and_get("ip:192.0.2.1", 1, window).await.unwrap();
    assert_eq!(first.count, 1);
    assert!(first.first_in_window);
    let ttl = first.expires_in.unwrap();
    assert!(ttl <= window && ttl > Duration::from_secs(25));

    let second = store.increment_and_get("ip:192.0.2.1", 2, window).await.unwrap();
    assert_eq!(second.count, 3);
    assert!(!second.first_in_window);
    assert!(second.expires_in.unwrap() <= ttl);
}

#[tokio::test]
async fn window_expires() {
    let Some(store) = store().await else { return };
    let window = Duration::from_millis(200);

    store.increment_and_get("user:bob", 5, window).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    let fresh = store.increment_and_get("user:bob", 1, window).await.unwrap();
    assert_eq!(fresh.count, 1);
    assert!(fresh.first_in_window);
}

#[tokio::test]
async fn unreachable_server_is_unavailable() {
    if std::env::var("TOLLGATE_TEST_REDIS_URL").is_err() {
        eprintln!("skipping: set TOLLGATE_TEST_REDIS_URL");
        return;
    }
    let err = RedisCounterStore::open("redis://127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, tollgate::StoreError::Unavailable { .. }));
}
