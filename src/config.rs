//! Configuration management for QuotaGuard.

use serde::{Deserialize, Serialize};

/// Main configuration for the QuotaGuard library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaGuardConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Optional path to a rate limit policy file; when absent the
    /// built-in policy presets are used
    pub policy_file: Option<String>,
}

impl Default for QuotaGuardConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            policy_file: None,
        }
    }
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Per-call response timeout in milliseconds. Store calls that take
    /// longer are reported as unavailable, never as an admit or a deny.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            response_timeout_ms: default_response_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_response_timeout() -> u64 {
    150
}

impl QuotaGuardConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: QuotaGuardConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::QuotaGuardError::Config(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuotaGuardConfig::default();
        assert_eq!(config.store.url, "redis://127.0.0.1:6379");
        assert_eq!(config.store.response_timeout_ms, 150);
        assert!(config.policy_file.is_none());
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
store:
  url: redis://cache.internal:6380
  response_timeout_ms: 80
policy_file: /etc/quotaguard/policies.yaml
"#;
        let config: QuotaGuardConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.url, "redis://cache.internal:6380");
        assert_eq!(config.store.response_timeout_ms, 80);
        assert_eq!(
            config.policy_file.as_deref(),
            Some("/etc/quotaguard/policies.yaml")
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
store:
  url: redis://cache.internal:6379
"#;
        let config: QuotaGuardConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.response_timeout_ms, 150);
    }
}
