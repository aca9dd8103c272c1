//! Error types for QuotaGuard.

use thiserror::Error;

/// Main error type for QuotaGuard operations.
///
/// Store-layer failures are split into two variants so callers can
/// distinguish an unreachable store from a store that replied in an
/// unexpected shape. Neither is ever folded into an admit or deny
/// decision by the limiter itself.
#[derive(Error, Debug)]
pub enum QuotaGuardError {
    /// Invalid policy or service configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name that is not present in the registry
    #[error("Unknown rate limit policy: {0}")]
    UnknownPolicy(String),

    /// The shared store could not be reached (connection, timeout)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The shared store replied with an unexpected shape
    #[error("Store protocol error: {0}")]
    StoreProtocol(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaGuardError {
    /// Whether this error originated in the store layer.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            QuotaGuardError::StoreUnavailable(_) | QuotaGuardError::StoreProtocol(_)
        )
    }
}

/// Result type alias for QuotaGuard operations.
pub type Result<T> = std::result::Result<T, QuotaGuardError>;
