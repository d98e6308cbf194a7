//! tiercache - Two-Tier Read-Through/Write-Through Cache
//!
//! A per-process local tier in front of a shared tier (Redis or in-process),
//! with stampede-free population, tag and pattern invalidation, and per-key
//! performance accounting.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ TieredCache ──▶ LocalTier (frames, capped TTL)
//!                 │
//!                 ├──────▶ SharedTier ──▶ SharedBackend (memory | redis)
//!                 ├──────▶ PopulationLocks (one factory per key)
//!                 ├──────▶ InvalidationIndex (tags + key registry)
//!                 └──────▶ PerformanceAccountant (hit/miss/latency)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Cache tiers, coordinator, index, accountant, optimizer
//! - [`config`] - YAML settings
//! - [`error`] - Error types
//! - [`exporter`] - Prometheus gauges

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub mod cache;
pub mod config;
pub mod error;
pub mod exporter;

// Re-export commonly used types
pub use cache::{
    CacheOptions, ExpirationPolicy, InMemorySharedBackend, Optimizer, RedisSharedBackend,
    SharedBackend, TieredCache, TieredCacheConfig, TierOrigin, WriteOutcome,
};
pub use config::{CacheSettings, SharedBackendKind, SharedSettings};
pub use error::{Error, Result};
pub use exporter::CacheExporter;

/// Build the configured shared backend.
///
/// Redis is used when configured and reachable. If the pool cannot be created
/// or the server does not answer, the in-process backend is used instead so
/// the cache still starts.
pub async fn create_shared_backend(settings: &SharedSettings) -> Arc<dyn SharedBackend> {
    if settings.backend == SharedBackendKind::Memory {
        tracing::info!("Using in-process shared backend");
        return Arc::new(InMemorySharedBackend::new());
    }

    tracing::info!(url = %settings.redis_url, "Connecting to Redis");
    let backend = match RedisSharedBackend::connect(&settings.redis_url, settings.pool_size, settings.timeout()) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create Redis pool. Falling back to in-process backend.");
            return Arc::new(InMemorySharedBackend::new());
        }
    };

    match tokio::time::timeout(settings.timeout(), backend.ping()).await {
        Ok(Ok(())) => {
            tracing::info!("Connected to Redis");
            Arc::new(backend)
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Redis unavailable. Falling back to in-process backend.");
            Arc::new(InMemorySharedBackend::new())
        }
        Err(_) => {
            tracing::warn!(timeout_ms = settings.timeout_ms, "Redis ping timed out. Falling back to in-process backend.");
            Arc::new(InMemorySharedBackend::new())
        }
    }
}

/// Parse a warmup seed: a JSON object mapping keys to values
pub fn parse_seed(raw: &str) -> Result<Vec<(String, serde_json::Value)>> {
    let seed: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)?;
    Ok(seed.into_iter().collect())
}

/// Read a warmup seed file
pub fn read_seed_file(path: impl AsRef<Path>) -> Result<Vec<(String, serde_json::Value)>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read seed file {}: {}", path.display(), e)))?;
    parse_seed(&raw)
}
