//! Cache settings
//!
//! YAML-loadable settings for the whole cache. Every field has a default, so
//! an empty document is a valid configuration.
//!
//! ```yaml
//! local:
//!   maxEntries: 10000
//!   ttlCapSecs: 300
//! shared:
//!   backend: redis
//!   redisUrl: redis://cache.internal:6379
//!   timeoutMs: 500
//! population:
//!   timeoutMs: 30000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CompressionConfig, LocalTierConfig, TieredCacheConfig};
use crate::error::{Error, Result};

/// Which shared backend to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedBackendKind {
    /// In-process map (single node)
    #[default]
    Memory,
    /// Redis via a connection pool
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalSettings {
    pub max_entries: usize,
    pub capacity_bytes: u64,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub eviction_batch_size: usize,
    /// Upper bound on any local entry's lifetime
    pub ttl_cap_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        let local = LocalTierConfig::default();
        Self {
            max_entries: local.max_entries,
            capacity_bytes: local.capacity_bytes,
            high_watermark: local.high_watermark,
            low_watermark: local.low_watermark,
            eviction_batch_size: local.eviction_batch_size,
            ttl_cap_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedSettings {
    pub backend: SharedBackendKind,
    pub redis_url: String,
    pub pool_size: usize,
    /// Per-call timeout
    pub timeout_ms: u64,
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self {
            backend: SharedBackendKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 16,
            timeout_ms: 1_000,
        }
    }
}

impl SharedSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PopulationSettings {
    /// Ceiling on one population (factory run or wait)
    pub timeout_ms: u64,
}

impl Default for PopulationSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizerSettings {
    pub interval_secs: u64,
    /// Fraction of live local entries dropped per pass
    pub compaction_fraction: f64,
    pub metric_staleness_secs: u64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            compaction_fraction: 0.25,
            metric_staleness_secs: 3_600,
        }
    }
}

impl OptimizerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub threshold_bytes: usize,
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        let compression = CompressionConfig::default();
        Self {
            enabled: compression.enabled,
            threshold_bytes: compression.min_size_bytes,
            level: compression.level,
        }
    }
}

/// Complete cache settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub local: LocalSettings,
    pub shared: SharedSettings,
    pub population: PopulationSettings,
    pub optimizer: OptimizerSettings,
    pub compression: CompressionSettings,
}

impl CacheSettings {
    /// Load and validate settings from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate settings from YAML text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let settings: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let local = &self.local;
        if local.ttl_cap_secs == 0 {
            return Err(Error::Config("local.ttlCapSecs must be greater than 0".into()));
        }
        if local.max_entries == 0 || local.capacity_bytes == 0 {
            return Err(Error::Config("local tier limits must be greater than 0".into()));
        }
        for (name, value) in [("highWatermark", local.high_watermark), ("lowWatermark", local.low_watermark)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!("local.{} must be in (0, 1], got {}", name, value)));
            }
        }
        if local.low_watermark > local.high_watermark {
            return Err(Error::Config(format!(
                "local.lowWatermark ({}) exceeds local.highWatermark ({})",
                local.low_watermark, local.high_watermark
            )));
        }
        if self.shared.timeout_ms == 0 {
            return Err(Error::Config("shared.timeoutMs must be greater than 0".into()));
        }
        if self.shared.backend == SharedBackendKind::Redis && self.shared.redis_url.trim().is_empty() {
            return Err(Error::Config("shared.redisUrl is required for the redis backend".into()));
        }
        if self.population.timeout_ms == 0 {
            return Err(Error::Config("population.timeoutMs must be greater than 0".into()));
        }
        if self.optimizer.interval_secs == 0 {
            return Err(Error::Config("optimizer.intervalSecs must be greater than 0".into()));
        }
        let fraction = self.optimizer.compaction_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(Error::Config(format!(
                "optimizer.compactionFraction must be in [0, 1], got {}",
                fraction
            )));
        }
        Ok(())
    }

    /// Coordinator configuration described by these settings
    pub fn cache_config(&self) -> TieredCacheConfig {
        TieredCacheConfig {
            local: LocalTierConfig {
                max_entries: self.local.max_entries,
                capacity_bytes: self.local.capacity_bytes,
                high_watermark: self.local.high_watermark,
                low_watermark: self.local.low_watermark,
                eviction_batch_size: self.local.eviction_batch_size,
            },
            local_ttl_cap: Duration::from_secs(self.local.ttl_cap_secs),
            shared_timeout: self.shared.timeout(),
            population_timeout: Duration::from_millis(self.population.timeout_ms),
            metric_staleness: Duration::from_secs(self.optimizer.metric_staleness_secs),
            compaction_fraction: self.optimizer.compaction_fraction,
            compression: CompressionConfig {
                enabled: self.compression.enabled,
                min_size_bytes: self.compression.threshold_bytes,
                level: self.compression.level,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.shared.backend, SharedBackendKind::Memory);

        let config = settings.cache_config();
        assert_eq!(config.local_ttl_cap, Duration::from_secs(300));
        assert_eq!(config.shared_timeout, Duration::from_millis(1_000));
        assert_eq!(config.population_timeout, Duration::from_secs(30));
        assert_eq!(config.metric_staleness, Duration::from_secs(3_600));
        assert_eq!(config.local.max_entries, 10_000);
        assert_eq!(config.compression.min_size_bytes, 4 * 1024);
        assert_eq!(settings.optimizer.interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(CacheSettings::from_yaml_str("").unwrap(), CacheSettings::default());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let settings = CacheSettings::from_yaml_str(
            r#"
local:
  ttlCapSecs: 60
shared:
  backend: redis
  redisUrl: redis://cache.internal:6379
  timeoutMs: 250
"#,
        )
        .unwrap();

        assert_eq!(settings.local.ttl_cap_secs, 60);
        assert_eq!(settings.local.max_entries, 10_000);
        assert_eq!(settings.shared.backend, SharedBackendKind::Redis);
        assert_eq!(settings.shared.timeout(), Duration::from_millis(250));
        assert_eq!(settings.shared.pool_size, 16);
        assert_eq!(settings.population.timeout_ms, 30_000);
    }

    #[test]
    fn test_rejects_zero_ttl_cap() {
        let result = CacheSettings::from_yaml_str("local:\n  ttlCapSecs: 0\n");
        assert_matches!(result, Err(Error::Config(msg)) if msg.contains("ttlCapSecs"));
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let mut settings = CacheSettings::default();
        settings.local.low_watermark = 0.95;
        assert_matches!(settings.validate(), Err(Error::Config(_)));

        settings.local.low_watermark = 0.5;
        settings.local.high_watermark = 1.5;
        assert_matches!(settings.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_bad_fraction_and_timeouts() {
        let mut settings = CacheSettings::default();
        settings.optimizer.compaction_fraction = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = CacheSettings::default();
        settings.population.timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = CacheSettings::default();
        settings.shared.timeout_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        assert_matches!(
            CacheSettings::from_yaml_str("local: [not, a, map]"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            CacheSettings::from_file("/definitely/not/here.yaml"),
            Err(Error::Config(msg)) if msg.contains("cannot read")
        );
    }
}
