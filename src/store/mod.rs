//! Window store abstractions and implementations.
//!
//! All durable limiter state lives behind the [`WindowStore`] trait: the
//! per-identifier timestamp sets and the block markers shared by every
//! service instance. The engine and block manager are stateless
//! computations over this store.

mod memory;
mod redis;

pub use self::memory::MemoryWindowStore;
pub use self::redis::RedisWindowStore;

use async_trait::async_trait;

use crate::error::Result;

/// Trait for shared window/block storage.
///
/// This trait abstracts over the Redis-backed store used in production and
/// the in-memory store used for tests and single-process deployments.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Atomically prune entries older than the window, count the remainder,
    /// record a new entry at `now_ms`, and refresh the key's TTL.
    ///
    /// Returns the count *before* the new entry was inserted. The entire
    /// sequence is indivisible with respect to concurrent callers on the
    /// same key; no caller can observe a partial state.
    async fn record_and_count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64>;

    /// Prune entries older than the window and count the remainder without
    /// recording a new entry.
    async fn count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64>;

    /// Get the block-expiry timestamp for a key, if a block record exists.
    async fn get_block(&self, key: &str) -> Result<Option<i64>>;

    /// Install a block record expiring at `expiry_ms`, with a store-side
    /// TTL of `ttl_ms`.
    async fn set_block(&self, key: &str, expiry_ms: i64, ttl_ms: u64) -> Result<()>;

    /// Remove a block record.
    async fn clear_block(&self, key: &str) -> Result<()>;

    /// Delete the given keys (window sets and/or block records).
    async fn delete(&self, keys: &[String]) -> Result<()>;
}
