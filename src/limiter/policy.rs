//! Rate limit policies and the policy registry.
//!
//! Policies are named, immutable configurations resolved once at process
//! start, either from the built-in presets or from a YAML policy file.
//! Validation happens at construction and fails fast; an invalid policy
//! must prevent startup rather than degrade at request time.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{QuotaGuardError, Result};

/// An immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Sliding window length in milliseconds
    pub window_ms: u64,
    /// Maximum requests admitted per window
    pub max_requests: u64,
    /// Namespace prefix for store keys
    pub key_namespace: String,
    /// Block duration after a violation, in milliseconds; 0 disables
    /// escalation
    pub block_duration_ms: u64,
}

impl RateLimitPolicy {
    /// Create a validated policy.
    pub fn new(
        window_ms: u64,
        max_requests: u64,
        key_namespace: impl Into<String>,
        block_duration_ms: u64,
    ) -> Result<Self> {
        if window_ms == 0 {
            return Err(QuotaGuardError::Config(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if max_requests == 0 {
            return Err(QuotaGuardError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            window_ms,
            max_requests,
            key_namespace: key_namespace.into(),
            block_duration_ms,
        })
    }

    /// Store key for an identifier's window entry set.
    pub fn window_key(&self, identifier: &str) -> String {
        format!("{}:{}", self.key_namespace, identifier)
    }

    /// Store key for an identifier's block record.
    pub fn block_key(&self, identifier: &str) -> String {
        format!("{}:block:{}", self.key_namespace, identifier)
    }
}

/// On-disk shape of a single policy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    pub window_ms: u64,
    pub max_requests: u64,
    pub key_namespace: String,
    #[serde(default)]
    pub block_duration_ms: u64,
}

/// On-disk shape of a policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: HashMap<String, PolicySpec>,
}

/// A closed set of named policies, resolved once at startup.
///
/// The registry exposes no mutation API at runtime; every lookup sees the
/// same immutable set.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, RateLimitPolicy>,
}

impl PolicyRegistry {
    /// Build a registry from named policies, validating each one.
    pub fn new(policies: HashMap<String, RateLimitPolicy>) -> Self {
        Self { policies }
    }

    /// The built-in preset policies.
    ///
    /// Namespaces and quotas match the platform's deployed profiles; the
    /// `auth` and `ip` profiles escalate to a temporary block on violation.
    pub fn builtin() -> Self {
        let presets = [
            ("api", 60_000, 100, "rl:api", 0),
            ("auth", 15 * 60_000, 5, "rl:auth", 30 * 60_000),
            ("password_reset", 60 * 60_000, 3, "rl:pwd", 0),
            ("email", 60_000, 5, "rl:email", 0),
            ("upload", 60_000, 10, "rl:upload", 0),
            ("admin", 60_000, 200, "rl:admin", 0),
            ("public", 60_000, 30, "rl:public", 0),
            ("webhook", 60_000, 100, "rl:webhook", 0),
            ("ip", 60_000, 1000, "rl:ip", 5 * 60_000),
        ];

        let policies = presets
            .into_iter()
            .map(|(name, window_ms, max_requests, namespace, block_ms)| {
                // Preset values are static and known-valid.
                let policy = RateLimitPolicy::new(window_ms, max_requests, namespace, block_ms)
                    .expect("built-in policy presets are valid");
                (name.to_string(), policy)
            })
            .collect();

        Self { policies }
    }

    /// Load a registry from a YAML policy file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a registry from a YAML string, validating every policy.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaGuardError::Config(format!("Failed to parse policy file: {}", e)))?;

        let mut policies = HashMap::new();
        for (name, spec) in file.policies {
            let policy = RateLimitPolicy::new(
                spec.window_ms,
                spec.max_requests,
                spec.key_namespace,
                spec.block_duration_ms,
            )
            .map_err(|e| QuotaGuardError::Config(format!("Policy {:?}: {}", name, e)))?;
            policies.insert(name, policy);
        }

        Ok(Self { policies })
    }

    /// Look up a policy by name.
    pub fn get(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(name)
    }

    /// Names of all registered policies.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the registry holds no policies.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
