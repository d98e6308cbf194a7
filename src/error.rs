//! Error types for the tiered cache

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
///
/// Tier-level failures (`Serialization`, `Backend`, `BackendTimeout`) are
/// absorbed inside the cache and only show up in logs and stats. Callers of
/// `get_or_set` see `Factory` and `PopulationTimeout`.
///
/// The enum is `Clone` so a single population outcome can be handed to every
/// caller waiting on the same key.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shared tier backend error
    #[error("Shared tier backend error: {0}")]
    Backend(String),

    /// Shared tier call exceeded its timeout
    #[error("Shared tier {operation} timed out after {timeout_ms}ms")]
    BackendTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Caller-supplied factory failed
    #[error("Factory failed for key {key}: {reason}")]
    Factory {
        key: String,
        reason: Arc<anyhow::Error>,
    },

    /// Population lock holder did not finish within the ceiling
    #[error("Population of key {key} timed out after {ceiling_ms}ms")]
    PopulationTimeout { key: String, ceiling_ms: u64 },

    /// Malformed key pattern
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a factory failure for `key`
    pub fn factory(key: &str, reason: anyhow::Error) -> Self {
        Error::Factory {
            key: key.to_string(),
            reason: Arc::new(reason),
        }
    }

    /// True for errors that originate in a cache tier rather than the caller
    pub fn is_tier_failure(&self) -> bool {
        matches!(
            self,
            Error::Serialization(_) | Error::Backend(_) | Error::BackendTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Backend(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Error::Backend(format!("connection pool: {}", e))
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Internal(format!("metrics registry: {}", e))
    }
}

// =============================================================================
// Tests
// =============================================================================
