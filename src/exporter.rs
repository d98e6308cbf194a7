//! Prometheus exporter
//!
//! Mirrors a `CacheStats` snapshot into gauges on a dedicated registry and
//! renders them in the text exposition format.

use prometheus::{
    register_gauge_with_registry, register_int_gauge_with_registry, Encoder, Gauge, IntGauge,
    Registry, TextEncoder,
};

use crate::cache::CacheStats;
use crate::error::{Error, Result};

/// Gauges describing one cache instance
#[derive(Clone)]
pub struct CacheExporter {
    registry: Registry,
    hit_rate: Gauge,
    local_entries: IntGauge,
    local_bytes: IntGauge,
    local_evictions: IntGauge,
    tracked_keys: IntGauge,
    tags: IntGauge,
    registered_keys: IntGauge,
    in_flight_populations: IntGauge,
    shared_calls: IntGauge,
    shared_failures: IntGauge,
    shared_timeouts: IntGauge,
}

impl CacheExporter {
    /// Create the gauges on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            hit_rate: register_gauge_with_registry!(
                "tiercache_hit_rate_percent",
                "Aggregate hit rate across tracked keys",
                registry
            )?,
            local_entries: register_int_gauge_with_registry!(
                "tiercache_local_entries",
                "Entries held by the local tier",
                registry
            )?,
            local_bytes: register_int_gauge_with_registry!(
                "tiercache_local_bytes",
                "Bytes held by the local tier",
                registry
            )?,
            local_evictions: register_int_gauge_with_registry!(
                "tiercache_local_evictions",
                "Entries evicted from the local tier since start",
                registry
            )?,
            tracked_keys: register_int_gauge_with_registry!(
                "tiercache_tracked_keys",
                "Keys with live performance metrics",
                registry
            )?,
            tags: register_int_gauge_with_registry!(
                "tiercache_tags",
                "Tags in the invalidation index",
                registry
            )?,
            registered_keys: register_int_gauge_with_registry!(
                "tiercache_registered_keys",
                "Keys in the invalidation key registry",
                registry
            )?,
            in_flight_populations: register_int_gauge_with_registry!(
                "tiercache_in_flight_populations",
                "Keys currently being populated by a factory",
                registry
            )?,
            shared_calls: register_int_gauge_with_registry!(
                "tiercache_shared_calls",
                "Shared tier calls since start",
                registry
            )?,
            shared_failures: register_int_gauge_with_registry!(
                "tiercache_shared_failures",
                "Shared tier calls that failed",
                registry
            )?,
            shared_timeouts: register_int_gauge_with_registry!(
                "tiercache_shared_timeouts",
                "Shared tier calls that timed out",
                registry
            )?,
            registry,
        })
    }

    /// Copy a stats snapshot into the gauges
    pub fn update(&self, stats: &CacheStats) {
        self.hit_rate.set(stats.hit_rate);
        self.local_entries.set(stats.local.entries as i64);
        self.local_bytes.set(stats.local.size_bytes as i64);
        self.local_evictions.set(stats.local.evictions as i64);
        self.tracked_keys.set(stats.tracked_keys as i64);
        self.tags.set(stats.index.tags as i64);
        self.registered_keys.set(stats.index.registered_keys as i64);
        self.in_flight_populations
            .set(stats.in_flight_populations as i64);
        self.shared_calls.set(stats.shared.calls as i64);
        self.shared_failures.set(stats.shared.failures as i64);
        self.shared_timeouts.set(stats.shared.timeouts as i64);
    }

    /// Render the registry in Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics output: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
