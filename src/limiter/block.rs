//! Block escalation management.
//!
//! A block is a time-bounded deny-all marker installed after repeated
//! quota violations (or manually, for abuse mitigation). While a block is
//! active every check for the identifier denies immediately and does not
//! consume a window slot. Expiry is passive: the store's TTL collects the
//! record, and a record the TTL has not yet collected is treated as absent
//! and lazily removed on the next consult. There is no sweeper.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::store::WindowStore;

/// Manages block records in the shared store.
///
/// Stateless over the store; safe to share across tasks.
pub struct BlockManager {
    store: Arc<dyn WindowStore>,
}

impl BlockManager {
    /// Create a block manager over a store handle.
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self { store }
    }

    /// Return the expiry of an active block for `block_key`, if any.
    ///
    /// A record whose expiry has passed is cleared and reported as absent.
    pub async fn active_block(&self, block_key: &str, now_ms: i64) -> Result<Option<i64>> {
        match self.store.get_block(block_key).await? {
            Some(expiry_ms) if expiry_ms > now_ms => Ok(Some(expiry_ms)),
            Some(_) => {
                // TTL has not collected the record yet; clear it lazily.
                self.store.clear_block(block_key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Install a block expiring at `expiry_ms` with a matching store TTL.
    pub async fn install(&self, block_key: &str, expiry_ms: i64, ttl_ms: u64) -> Result<()> {
        debug!(key = %block_key, expiry_ms, "Installing block");
        self.store.set_block(block_key, expiry_ms, ttl_ms).await
    }

    /// Remove a block record, if present.
    pub async fn lift(&self, block_key: &str) -> Result<()> {
        debug!(key = %block_key, "Lifting block");
        self.store.clear_block(block_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryWindowStore;

    fn manager() -> (Arc<MemoryWindowStore>, BlockManager) {
        let store = Arc::new(MemoryWindowStore::new());
        let blocks = BlockManager::new(store.clone());
        (store, blocks)
    }

    #[tokio::test]
    async fn test_no_block_by_default() {
        let (_store, blocks) = manager();
        assert_eq!(blocks.active_block("rl:x:block:id", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_active_block_reported_until_expiry() {
        let (_store, blocks) = manager();

        blocks.install("k", 5000, 5000).await.unwrap();

        assert_eq!(blocks.active_block("k", 4999).await.unwrap(), Some(5000));
        assert_eq!(blocks.active_block("k", 5000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_block_is_lazily_cleared() {
        let (store, blocks) = manager();

        blocks.install("k", 1000, 1000).await.unwrap();

        // Past expiry: the consult reports no block and removes the record.
        assert_eq!(blocks.active_block("k", 2000).await.unwrap(), None);
        assert_eq!(store.get_block("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lift_removes_block() {
        let (_store, blocks) = manager();

        blocks.install("k", 5000, 5000).await.unwrap();
        blocks.lift("k").await.unwrap();

        assert_eq!(blocks.active_block("k", 0).await.unwrap(), None);
    }
}
