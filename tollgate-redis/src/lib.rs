//! Redis counter store for `tollgate` (companion crate).
//!
//! Bring your own `redis::Client`; counters live under a key prefix and are driven by a
//! single server-side script, so the increment and the window expiry are one atomic step.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tollgate::{CounterSnapshot, CounterStore, StoreError};
use tracing::{debug, warn};

/// Default prefix prepended to every counter key.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:";

// KEYS[1] counter, ARGV[1] amount, ARGV[2] window in ms.
// Expiry is set only by the increment that created the key. A key found without a TTL
// (left behind by a crash between commands on some other client) is given one.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count == tonumber(ARGV[1]) then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    ttl = tonumber(ARGV[2])
end
return {count, ttl}
"#;

/// Shared fixed-window counters in Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: redis::Script,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("connection", &"<redis::aio::ConnectionManager>")
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect through `client` and verify the server answers.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the connection cannot be established.
    pub async fn connect(client: redis::Client) -> Result<Self, StoreError> {
        let mut connection =
            ConnectionManager::new(client).await.map_err(|e| unavailable("<connect>", &e))?;
        let pong: String =
            redis::cmd("PING").query_async(&mut connection).await.map_err(|e| unavailable("<ping>", &e))?;
        debug!(target: "tollgate::redis", reply = %pong, "connected to redis");
        Ok(Self::from_connection(connection))
    }

    /// Open `url` (e.g. `redis://127.0.0.1:6379`) and connect.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| unavailable("<open>", &e))?;
        Self::connect(client).await
    }

    /// Wrap an existing connection manager without a round-trip.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: redis::Script::new(INCREMENT_SCRIPT),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Replace the key prefix. Instances sharing a limit must share a prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

fn unavailable(key: &str, err: &redis::RedisError) -> StoreError {
    StoreError::Unavailable { key: key.to_string(), message: err.to_string() }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        window: Duration,
    ) -> Result<CounterSnapshot, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.connection.clone();
        let reply: (u64, i64) = self
            .script
            .key(&redis_key)
            .arg(amount)
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "tollgate::redis", key = %redis_key, error = %e, "increment failed");
                unavailable(&redis_key, &e)
            })?;

        let (count, ttl_ms) = reply;
        Ok(CounterSnapshot {
            count,
            first_in_window: count == amount,
            expires_in: u64::try_from(ttl_ms).ok().map(Duration::from_millis),
        })
    }
}
