//! Redis-backed window store.
//!
//! The prune-count-insert sequence runs as a single server-side Lua script,
//! so it is indivisible with respect to concurrent callers on the same key
//! across every service instance sharing the store. Scoring uses the store
//! caller's wall clock in epoch milliseconds; entries within the same
//! millisecond are uniquified with a random suffix so none are silently
//! overwritten.

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{QuotaGuardError, Result};

use super::WindowStore;

/// Atomic prune / count / record / refresh-TTL, returning the count before
/// the insert. KEYS[1] = window key; ARGV = window start, now, member, ttl.
const RECORD_AND_COUNT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return count
"#;

/// Extra TTL on window keys beyond the window itself, so a key never
/// expires while it still holds countable entries.
const TTL_GRACE_MS: u64 = 1000;

/// A window store backed by a shared Redis instance.
pub struct RedisWindowStore {
    /// Multiplexed connection shared by all calls
    conn: ConnectionManager,
    /// Upper bound on any single store call
    response_timeout: Duration,
    /// Preloaded prune-count-insert script
    record_script: Script,
}

impl RedisWindowStore {
    /// Connect to the shared store described by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        debug!(url = %config.url, "Connecting to shared window store");

        let client = Client::open(config.url.as_str())
            .map_err(|e| QuotaGuardError::Config(format!("Invalid store URL: {}", e)))?;

        let conn = client
            .get_connection_manager()
            .await
            .map_err(map_redis_err)?;

        info!(
            timeout_ms = config.response_timeout_ms,
            "Connected to shared window store"
        );

        Ok(Self {
            conn,
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            record_script: Script::new(RECORD_AND_COUNT_SCRIPT),
        })
    }

    /// Run a store call under the configured response timeout.
    ///
    /// A timeout is reported as `StoreUnavailable`, never as an admit or a
    /// deny; the adapter owns the fail-open vs fail-closed decision.
    async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.response_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_redis_err(e)),
            Err(_) => Err(QuotaGuardError::StoreUnavailable(format!(
                "store call exceeded {}ms",
                self.response_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl WindowStore for RedisWindowStore {
    async fn record_and_count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let window_start = now_ms - window_ms as i64;
        let member = format!("{}:{}", now_ms, Uuid::new_v4());
        let ttl_ms = window_ms + TTL_GRACE_MS;

        self.run(async move {
            self.record_script
                .key(key)
                .arg(window_start)
                .arg(now_ms)
                .arg(member)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let window_start = now_ms - window_ms as i64;

        let (count,): (u64,) = self
            .run(async move {
                redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg("-inf")
                    .arg(window_start)
                    .ignore()
                    .cmd("ZCARD")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(count)
    }

    async fn get_block(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();

        let value: Option<String> = self
            .run(async move { redis::cmd("GET").arg(key).query_async(&mut conn).await })
            .await?;

        match value {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| {
                    QuotaGuardError::StoreProtocol(format!(
                        "block record for {} holds non-numeric value {:?}",
                        key, raw
                    ))
                }),
            None => Ok(None),
        }
    }

    async fn set_block(&self, key: &str, expiry_ms: i64, ttl_ms: u64) -> Result<()> {
        let mut conn = self.conn.clone();

        self.run(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(expiry_ms)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn clear_block(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        self.run(async move { redis::cmd("DEL").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys = keys.to_vec();

        self.run(async move { redis::cmd("DEL").arg(keys).query_async(&mut conn).await })
            .await
    }
}

/// Classify a Redis error: connectivity problems are `StoreUnavailable`,
/// anything else means the store replied in an unexpected shape and is a
/// bug rather than a capacity signal.
fn map_redis_err(e: RedisError) -> QuotaGuardError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
    {
        QuotaGuardError::StoreUnavailable(e.to_string())
    } else {
        QuotaGuardError::StoreProtocol(e.to_string())
    }
}
