//! Error types for the layered cache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the layered cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Lookup Outcomes
    // =========================================================================
    /// No enabled tier holds the key. Callers fall back to the source of truth.
    #[error("Cache miss for key: {key}")]
    CacheMiss { key: String },

    /// The caller's cancellation token fired while a tier call was in flight
    #[error("Cache operation cancelled")]
    Cancelled,

    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// Tier-2/tier-3 transport failure
    #[error("{tier} backend error: {reason}")]
    Backend { tier: String, reason: String },

    /// Tier-2/tier-3 call exceeded the configured backend timeout
    #[error("{tier} backend timed out after {timeout:?}")]
    Timeout { tier: String, timeout: Duration },

    /// One or more tiers failed to drop a key
    #[error("Invalidation of {key} failed: {}", failures.join("; "))]
    InvalidationFailed { key: String, failures: Vec<String> },

    /// Glob pattern could not be compiled
    #[error("Invalid invalidation pattern: {0}")]
    InvalidPattern(String),

    // =========================================================================
    // Value Codec Errors
    // =========================================================================
    /// Value could not be encoded for, or decoded from, tier 2/3
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Warm-up Errors
    // =========================================================================
    /// At least one warm-up job failed or timed out during a cycle
    #[error("Warm-up cycle failed: {failed}/{total} jobs failed ({})", failures.join("; "))]
    WarmupFailed {
        failed: usize,
        total: usize,
        failures: Vec<String>,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Service Errors
    // =========================================================================
    /// Prometheus registration or encoding failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a backend error for the given tier
    pub fn backend(tier: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::Backend {
            tier: tier.to_string(),
            reason: reason.into(),
        }
    }

    /// True for the distinguished "not found" outcome of `get`
    pub fn is_miss(&self) -> bool {
        matches!(self, Error::CacheMiss { .. })
    }

    /// True when the operation was abandoned because its token was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_is_distinguished() {
        let err = Error::CacheMiss {
            key: "market:BTCUSDT".to_string(),
        };
        assert!(err.is_miss());
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "Cache miss for key: market:BTCUSDT");
    }

    #[test]
    fn test_invalidation_failure_lists_every_tier() {
        let err = Error::InvalidationFailed {
            key: "k".to_string(),
            failures: vec!["L2: down".to_string(), "L3: locked".to_string()],
        };
        assert_eq!(err.to_string(), "Invalidation of k failed: L2: down; L3: locked");
    }

    #[test]
    fn test_backend_helper() {
        let err = Error::backend("L2", "connection refused");
        assert_eq!(err.to_string(), "L2 backend error: connection refused");
    }
}
