//! In-memory window store.
//!
//! Single-process stand-in for the shared Redis store, used by tests and
//! available for deployments that run one instance. Each operation holds a
//! mutex across the whole prune-count-insert sequence, so the atomicity
//! guarantee matches the Lua-scripted store (overshoot of zero under
//! concurrent callers).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;

use super::WindowStore;

/// A window store held entirely in process memory.
///
/// Block records are kept until explicitly cleared; the block manager
/// treats a past-expiry record as absent and lazily removes it, so no
/// TTL machinery is needed here. Window entries age out by pruning on
/// every call.
#[derive(Default)]
pub struct MemoryWindowStore {
    /// Window key -> request timestamps (ms), unordered
    windows: Mutex<HashMap<String, Vec<i64>>>,
    /// Block key -> block-expiry timestamp (ms)
    blocks: Mutex<HashMap<String, i64>>,
}

impl MemoryWindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries in a window key, without pruning.
    ///
    /// Test and introspection helper; production callers go through
    /// [`WindowStore::count`].
    pub fn raw_window_len(&self, key: &str) -> usize {
        self.windows
            .lock()
            .get(key)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record_and_count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64> {
        let mut windows = self.windows.lock();
        let entries = windows.entry(key.to_string()).or_default();

        let window_start = now_ms - window_ms as i64;
        entries.retain(|&ts| ts > window_start);

        let count = entries.len() as u64;
        entries.push(now_ms);
        Ok(count)
    }

    async fn count(&self, key: &str, now_ms: i64, window_ms: u64) -> Result<u64> {
        let mut windows = self.windows.lock();
        let Some(entries) = windows.get_mut(key) else {
            return Ok(0);
        };

        let window_start = now_ms - window_ms as i64;
        entries.retain(|&ts| ts > window_start);
        Ok(entries.len() as u64)
    }

    async fn get_block(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.blocks.lock().get(key).copied())
    }

    async fn set_block(&self, key: &str, expiry_ms: i64, _ttl_ms: u64) -> Result<()> {
        self.blocks.lock().insert(key.to_string(), expiry_ms);
        Ok(())
    }

    async fn clear_block(&self, key: &str) -> Result<()> {
        self.blocks.lock().remove(key);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut windows = self.windows.lock();
        let mut blocks = self.blocks.lock();
        for key in keys {
            windows.remove(key);
            blocks.remove(key);
        }
        Ok(())
    }
}
