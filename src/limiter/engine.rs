//! Sliding window admission engine.
//!
//! The engine is a stateless computation over the shared window store: per
//! check it consults the block manager, then atomically prunes, counts, and
//! records the request in the identifier's window, returning an admission
//! decision. All synchronization is delegated to the store's atomic
//! command; the engine holds no in-memory locks.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{QuotaGuardError, Result};
use crate::store::WindowStore;

use super::block::BlockManager;
use super::policy::{PolicyRegistry, RateLimitPolicy};

/// Fallback duration for a manual block when neither the caller nor the
/// policy provides one.
const DEFAULT_MANUAL_BLOCK_MS: u64 = 60 * 60 * 1000;

/// The outcome of a single admission check.
///
/// Produced fresh per call; never persisted. A store failure is reported
/// through `store_error` and is distinct from both an admit and a deny —
/// the adapter decides fail-open vs fail-closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Whether the request was admitted
    pub admitted: bool,
    /// Remaining quota in the current window
    pub remaining: u64,
    /// When the window (or block) resets, epoch milliseconds
    pub reset_at: i64,
    /// Seconds until a retry can succeed, present on denials
    pub retry_after_secs: Option<u64>,
    /// Whether an active block produced this denial
    pub blocked: bool,
    /// Whether the shared store failed; no admission decision was made
    pub store_error: bool,
}

impl CheckResult {
    fn admitted(policy: &RateLimitPolicy, count_before: u64, now_ms: i64) -> Self {
        Self {
            admitted: true,
            remaining: policy.max_requests - count_before - 1,
            reset_at: now_ms + policy.window_ms as i64,
            retry_after_secs: None,
            blocked: false,
            store_error: false,
        }
    }

    fn denied(policy: &RateLimitPolicy, now_ms: i64, retry_after_secs: u64) -> Self {
        Self {
            admitted: false,
            remaining: 0,
            reset_at: now_ms + policy.window_ms as i64,
            retry_after_secs: Some(retry_after_secs),
            blocked: false,
            store_error: false,
        }
    }

    fn blocked(expiry_ms: i64, now_ms: i64) -> Self {
        Self {
            admitted: false,
            remaining: 0,
            reset_at: expiry_ms,
            retry_after_secs: Some(ceil_secs(expiry_ms.saturating_sub(now_ms).max(0) as u64)),
            blocked: true,
            store_error: false,
        }
    }

    fn store_failure(now_ms: i64) -> Self {
        Self {
            admitted: false,
            remaining: 0,
            reset_at: now_ms,
            retry_after_secs: None,
            blocked: false,
            store_error: true,
        }
    }
}

/// The sliding window rate limiter.
///
/// Owns a handle to the shared store and an immutable policy registry.
/// Safe to share across tasks; invoked per request from any number of
/// concurrently-running instances.
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    registry: PolicyRegistry,
    blocks: BlockManager,
}

impl RateLimiter {
    /// Create a limiter over a store handle and a policy registry.
    pub fn new(store: Arc<dyn WindowStore>, registry: PolicyRegistry) -> Self {
        let blocks = BlockManager::new(store.clone());
        Self {
            store,
            registry,
            blocks,
        }
    }

    /// Create a limiter with the built-in preset policies.
    pub fn with_builtin_policies(store: Arc<dyn WindowStore>) -> Self {
        Self::new(store, PolicyRegistry::builtin())
    }

    /// The policy registry in use.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    fn policy(&self, name: &str) -> Result<&RateLimitPolicy> {
        self.registry
            .get(name)
            .ok_or_else(|| QuotaGuardError::UnknownPolicy(name.to_string()))
    }

    /// Check whether a request for `identifier` is admitted under the named
    /// policy, recording the attempt.
    ///
    /// Uses the process wall clock. All instances sharing a store must use
    /// a synchronized clock reference; divergent clocks break the window
    /// invariant (a deployment requirement, not a code concern).
    pub async fn check(&self, policy_name: &str, identifier: &str) -> Result<CheckResult> {
        self.check_at(policy_name, identifier, now_ms()).await
    }

    /// [`check`](Self::check) with an explicit timestamp.
    pub async fn check_at(
        &self,
        policy_name: &str,
        identifier: &str,
        now_ms: i64,
    ) -> Result<CheckResult> {
        let policy = self.policy(policy_name)?;
        let block_key = policy.block_key(identifier);

        // An active block short-circuits the window entirely: the denial
        // consumes no window slot.
        match self.blocks.active_block(&block_key, now_ms).await {
            Ok(Some(expiry_ms)) => {
                debug!(
                    policy = policy_name,
                    identifier = identifier,
                    expiry_ms,
                    "Check denied by active block"
                );
                return Ok(CheckResult::blocked(expiry_ms, now_ms));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(policy = policy_name, error = %e, "Block lookup failed");
                return Ok(CheckResult::store_failure(now_ms));
            }
        }

        let window_key = policy.window_key(identifier);
        let count_before = match self
            .store
            .record_and_count(&window_key, now_ms, policy.window_ms)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(policy = policy_name, error = %e, "Window check failed");
                return Ok(CheckResult::store_failure(now_ms));
            }
        };

        if count_before >= policy.max_requests {
            let mut retry_after_secs = ceil_secs(policy.window_ms);

            if policy.block_duration_ms > 0 {
                let expiry_ms = now_ms + policy.block_duration_ms as i64;
                match self
                    .blocks
                    .install(&block_key, expiry_ms, policy.block_duration_ms)
                    .await
                {
                    Ok(()) => retry_after_secs = ceil_secs(policy.block_duration_ms),
                    // The denial stands on the window count alone; only the
                    // escalation was lost.
                    Err(e) => {
                        warn!(policy = policy_name, error = %e, "Block install failed")
                    }
                }
            }

            debug!(
                policy = policy_name,
                identifier = identifier,
                count = count_before,
                limit = policy.max_requests,
                "Rate limit exceeded"
            );
            return Ok(CheckResult::denied(policy, now_ms, retry_after_secs));
        }

        Ok(CheckResult::admitted(policy, count_before, now_ms))
    }

    /// Inspect the current window and block state without recording an
    /// attempt. Repeated peeks without an intervening check return the
    /// same remaining quota.
    pub async fn peek(&self, policy_name: &str, identifier: &str) -> Result<CheckResult> {
        self.peek_at(policy_name, identifier, now_ms()).await
    }

    /// [`peek`](Self::peek) with an explicit timestamp.
    pub async fn peek_at(
        &self,
        policy_name: &str,
        identifier: &str,
        now_ms: i64,
    ) -> Result<CheckResult> {
        let policy = self.policy(policy_name)?;
        let block_key = policy.block_key(identifier);

        match self.blocks.active_block(&block_key, now_ms).await {
            Ok(Some(expiry_ms)) => return Ok(CheckResult::blocked(expiry_ms, now_ms)),
            Ok(None) => {}
            Err(e) => {
                warn!(policy = policy_name, error = %e, "Block lookup failed");
                return Ok(CheckResult::store_failure(now_ms));
            }
        }

        let window_key = policy.window_key(identifier);
        let count = match self
            .store
            .count(&window_key, now_ms, policy.window_ms)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(policy = policy_name, error = %e, "Window peek failed");
                return Ok(CheckResult::store_failure(now_ms));
            }
        };

        Ok(CheckResult {
            admitted: count < policy.max_requests,
            remaining: policy.max_requests.saturating_sub(count),
            reset_at: now_ms + policy.window_ms as i64,
            retry_after_secs: None,
            blocked: false,
            store_error: false,
        })
    }

    /// Clear all window and block state for an identifier. The next check
    /// behaves identically to a first-ever call.
    pub async fn reset(&self, policy_name: &str, identifier: &str) -> Result<()> {
        let policy = self.policy(policy_name)?;
        self.store
            .delete(&[policy.window_key(identifier), policy.block_key(identifier)])
            .await
    }

    /// Manually block an identifier, unconditionally.
    ///
    /// Falls back to the policy's block duration when `duration_ms` is
    /// absent, then to a one hour default.
    pub async fn block(
        &self,
        policy_name: &str,
        identifier: &str,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        self.block_at(policy_name, identifier, duration_ms, now_ms())
            .await
    }

    /// [`block`](Self::block) with an explicit timestamp.
    pub async fn block_at(
        &self,
        policy_name: &str,
        identifier: &str,
        duration_ms: Option<u64>,
        now_ms: i64,
    ) -> Result<()> {
        let policy = self.policy(policy_name)?;

        let duration_ms = duration_ms
            .filter(|&d| d > 0)
            .or_else(|| (policy.block_duration_ms > 0).then_some(policy.block_duration_ms))
            .unwrap_or(DEFAULT_MANUAL_BLOCK_MS);

        let block_key = policy.block_key(identifier);
        self.blocks
            .install(&block_key, now_ms + duration_ms as i64, duration_ms)
            .await
    }

    /// Lift any block and clear the window for an identifier, returning it
    /// to a fresh state.
    pub async fn unblock(&self, policy_name: &str, identifier: &str) -> Result<()> {
        let policy = self.policy(policy_name)?;
        self.blocks.lift(&policy.block_key(identifier)).await?;
        self.store.delete(&[policy.window_key(identifier)]).await
    }
}

/// Current wall clock in epoch milliseconds.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::policy::PolicyRegistry;
    use crate::store::MemoryWindowStore;
    use futures::future::join_all;
    use std::collections::HashMap;

    fn limiter_with(policy: RateLimitPolicy) -> (Arc<MemoryWindowStore>, RateLimiter) {
        let store = Arc::new(MemoryWindowStore::new());
        let mut policies = HashMap::new();
        policies.insert("test".to_string(), policy);
        let limiter = RateLimiter::new(store.clone(), PolicyRegistry::new(policies));
        (store, limiter)
    }

    fn basic_policy() -> RateLimitPolicy {
        RateLimitPolicy::new(1000, 3, "rl:test", 0).unwrap()
    }

    fn escalating_policy() -> RateLimitPolicy {
        RateLimitPolicy::new(1000, 3, "rl:test", 5000).unwrap()
    }

    /// Store double whose every call fails with an unreachable store.
    struct FailingStore;

    #[async_trait::async_trait]
    impl crate::store::WindowStore for FailingStore {
        async fn record_and_count(&self, _: &str, _: i64, _: u64) -> Result<u64> {
            Err(QuotaGuardError::StoreUnavailable("down".to_string()))
        }
        async fn count(&self, _: &str, _: i64, _: u64) -> Result<u64> {
            Err(QuotaGuardError::StoreUnavailable("down".to_string()))
        }
        async fn get_block(&self, _: &str) -> Result<Option<i64>> {
            Err(QuotaGuardError::StoreUnavailable("down".to_string()))
        }
        async fn set_block(&self, _: &str, _: i64, _: u64) -> Result<()> {
            Err(QuotaGuardError::StoreUnavailable("down".to_string()))
        }
        async fn clear_block(&self, _: &str) -> Result<()> {
            Err(QuotaGuardError::StoreUnavailable("down".to_string()))
        }
        async fn delete(&self, _: &[String]) -> Result<()> {
            Err(QuotaGuardError::StoreUnavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_quota_admits_then_denies() {
        let (_store, limiter) = limiter_with(basic_policy());

        let expected_remaining = [2, 1, 0];
        for (i, t) in [0, 100, 200].into_iter().enumerate() {
            let result = limiter.check_at("test", "client", t).await.unwrap();
            assert!(result.admitted, "call at t={} should be admitted", t);
            assert_eq!(result.remaining, expected_remaining[i]);
            assert_eq!(result.reset_at, t + 1000);
        }

        let result = limiter.check_at("test", "client", 300).await.unwrap();
        assert!(!result.admitted);
        assert!(!result.blocked);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after_secs, Some(1));
    }

    #[tokio::test]
    async fn test_window_slides_forward() {
        let (_store, limiter) = limiter_with(basic_policy());

        for t in [0, 100, 200] {
            assert!(limiter.check_at("test", "client", t).await.unwrap().admitted);
        }
        assert!(!limiter.check_at("test", "client", 300).await.unwrap().admitted);

        // The t=0 entry has aged out of [1, 1001].
        let result = limiter.check_at("test", "client", 1001).await.unwrap();
        assert!(result.admitted);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (_store, limiter) = limiter_with(basic_policy());

        for t in [0, 10, 20] {
            limiter.check_at("test", "a", t).await.unwrap();
        }
        assert!(!limiter.check_at("test", "a", 30).await.unwrap().admitted);

        let result = limiter.check_at("test", "b", 30).await.unwrap();
        assert!(result.admitted);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_violation_installs_block() {
        let (store, limiter) = limiter_with(escalating_policy());

        for t in [0, 10, 20] {
            limiter.check_at("test", "client", t).await.unwrap();
        }

        // The violating call reports the block duration as the retry hint.
        let result = limiter.check_at("test", "client", 30).await.unwrap();
        assert!(!result.admitted);
        assert_eq!(result.retry_after_secs, Some(5));
        assert_eq!(store.get_block("rl:test:block:client").await.unwrap(), Some(5030));

        // Later checks deny via the block without touching the window,
        // even after the window itself would have reset.
        let window_len = store.raw_window_len("rl:test:client");
        let result = limiter.check_at("test", "client", 2000).await.unwrap();
        assert!(!result.admitted);
        assert!(result.blocked);
        assert_eq!(store.raw_window_len("rl:test:client"), window_len);
    }

    #[tokio::test]
    async fn test_no_block_without_escalation_policy() {
        let (store, limiter) = limiter_with(basic_policy());

        for t in [0, 10, 20, 30] {
            limiter.check_at("test", "client", t).await.unwrap();
        }

        assert_eq!(store.get_block("rl:test:block:client").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_manual_block() {
        let (store, limiter) = limiter_with(basic_policy());

        limiter
            .block_at("test", "client", Some(1000), 0)
            .await
            .unwrap();

        let result = limiter.check_at("test", "client", 1).await.unwrap();
        assert!(!result.admitted);
        assert!(result.blocked);
        assert!(result.retry_after_secs.unwrap() <= 1);
        assert_eq!(result.reset_at, 1000);

        // The blocked check consumed no window slot.
        assert_eq!(store.raw_window_len("rl:test:client"), 0);

        // Past expiry the identifier is fresh again.
        let result = limiter.check_at("test", "client", 1500).await.unwrap();
        assert!(result.admitted);
    }

    #[tokio::test]
    async fn test_manual_block_duration_fallback() {
        let (store, limiter) = limiter_with(basic_policy());

        // No explicit duration and a non-escalating policy: one hour.
        limiter.block_at("test", "client", None, 0).await.unwrap();
        assert_eq!(
            store.get_block("rl:test:block:client").await.unwrap(),
            Some(DEFAULT_MANUAL_BLOCK_MS as i64)
        );
    }

    #[tokio::test]
    async fn test_manual_block_uses_policy_duration() {
        let (store, limiter) = limiter_with(escalating_policy());

        limiter.block_at("test", "client", None, 0).await.unwrap();
        assert_eq!(
            store.get_block("rl:test:block:client").await.unwrap(),
            Some(5000)
        );
    }

    #[tokio::test]
    async fn test_expired_block_is_ignored() {
        let (store, limiter) = limiter_with(basic_policy());

        store
            .set_block("rl:test:block:client", 500, 500)
            .await
            .unwrap();

        let result = limiter.check_at("test", "client", 1000).await.unwrap();
        assert!(result.admitted);
        assert_eq!(store.get_block("rl:test:block:client").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_returns_identifier_to_fresh() {
        let (_store, limiter) = limiter_with(escalating_policy());

        for t in [0, 10, 20, 30] {
            limiter.check_at("test", "client", t).await.unwrap();
        }
        assert!(!limiter.check_at("test", "client", 40).await.unwrap().admitted);

        limiter.reset("test", "client").await.unwrap();

        let result = limiter.check_at("test", "client", 50).await.unwrap();
        assert!(result.admitted);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_unblock_clears_block_and_window() {
        let (store, limiter) = limiter_with(escalating_policy());

        for t in [0, 10, 20, 30] {
            limiter.check_at("test", "client", t).await.unwrap();
        }
        assert!(store.get_block("rl:test:block:client").await.unwrap().is_some());

        limiter.unblock("test", "client").await.unwrap();

        assert_eq!(store.get_block("rl:test:block:client").await.unwrap(), None);
        assert_eq!(store.raw_window_len("rl:test:client"), 0);

        let result = limiter.check_at("test", "client", 40).await.unwrap();
        assert!(result.admitted);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test]
    async fn test_peek_is_non_mutating() {
        let (_store, limiter) = limiter_with(basic_policy());

        limiter.check_at("test", "client", 0).await.unwrap();
        limiter.check_at("test", "client", 10).await.unwrap();

        for _ in 0..3 {
            let result = limiter.peek_at("test", "client", 20).await.unwrap();
            assert!(result.admitted);
            assert_eq!(result.remaining, 1);
        }
    }

    #[tokio::test]
    async fn test_peek_reports_active_block() {
        let (_store, limiter) = limiter_with(basic_policy());

        limiter
            .block_at("test", "client", Some(2000), 0)
            .await
            .unwrap();

        let result = limiter.peek_at("test", "client", 100).await.unwrap();
        assert!(!result.admitted);
        assert!(result.blocked);
        assert_eq!(result.reset_at, 2000);
    }

    #[tokio::test]
    async fn test_peek_on_fresh_identifier() {
        let (_store, limiter) = limiter_with(basic_policy());

        let result = limiter.peek_at("test", "nobody", 0).await.unwrap();
        assert!(result.admitted);
        assert_eq!(result.remaining, 3);
        assert!(!result.store_error);
    }

    #[tokio::test]
    async fn test_concurrent_checks_admit_exactly_quota() {
        let policy = RateLimitPolicy::new(1000, 5, "rl:test", 0).unwrap();
        let (_store, limiter) = limiter_with(policy);

        let checks = (0..20).map(|_| limiter.check_at("test", "client", 0));
        let results = join_all(checks).await;

        let admitted = results
            .into_iter()
            .filter(|r| r.as_ref().unwrap().admitted)
            .count();
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_store_failure_is_not_an_admission_decision() {
        let limiter = RateLimiter::new(
            Arc::new(FailingStore),
            PolicyRegistry::new(HashMap::from([("test".to_string(), basic_policy())])),
        );

        let result = limiter.check_at("test", "client", 0).await.unwrap();
        assert!(result.store_error);
        assert!(!result.admitted);
        assert!(!result.blocked);
        assert_eq!(result.retry_after_secs, None);

        let result = limiter.peek_at("test", "client", 0).await.unwrap();
        assert!(result.store_error);

        // Administrative operations propagate the failure instead.
        assert!(limiter.reset("test", "client").await.is_err());
        assert!(limiter.block("test", "client", Some(1000)).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_policy_is_an_error() {
        let (_store, limiter) = limiter_with(basic_policy());

        let result = limiter.check_at("nope", "client", 0).await;
        assert!(matches!(result, Err(QuotaGuardError::UnknownPolicy(_))));
    }

    #[tokio::test]
    async fn test_builtin_limiter_construction() {
        let limiter = RateLimiter::with_builtin_policies(Arc::new(MemoryWindowStore::new()));
        assert!(limiter.registry().get("api").is_some());

        let result = limiter.check("api", "10.0.0.1").await.unwrap();
        assert!(result.admitted);
        assert_eq!(result.remaining, 99);
    }
}
