//! Performance Accountant
//!
//! Per-key hit/miss/latency counters. Records live only for the process
//! lifetime and are purged once idle longer than the staleness window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Default staleness window (1 hour)
pub const DEFAULT_METRIC_STALENESS: Duration = Duration::from_secs(60 * 60);

/// Counters for one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetric {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_requests: u64,
    pub total_response_time_ms: f64,
    pub average_response_time_ms: f64,
    pub last_accessed: DateTime<Utc>,
}

impl PerformanceMetric {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            cache_hits: 0,
            cache_misses: 0,
            total_requests: 0,
            total_response_time_ms: 0.0,
            average_response_time_ms: 0.0,
            last_accessed: now,
        }
    }

    fn record(&mut self, hit: bool, elapsed_ms: f64, now: DateTime<Utc>) {
        if hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
        self.total_requests += 1;
        self.total_response_time_ms += elapsed_ms;
        self.average_response_time_ms = self.total_response_time_ms / self.total_requests as f64;
        self.last_accessed = now;
    }

    /// Hit rate for this key as a percentage
    pub fn hit_rate(&self) -> f64 {
        percentage(self.cache_hits, self.cache_misses)
    }
}

fn percentage(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64 * 100.0
    }
}

/// Thread-safe store of per-key metrics, injected into the coordinator
#[derive(Debug)]
pub struct PerformanceAccountant {
    metrics: DashMap<String, PerformanceMetric>,
    staleness: Duration,
}

impl PerformanceAccountant {
    pub fn new(staleness: Duration) -> Self {
        Self {
            metrics: DashMap::new(),
            staleness,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Record one call outcome for `key`
    pub fn record_outcome(&self, key: &str, hit: bool, elapsed: Duration) {
        self.record_outcome_at(key, hit, elapsed, Utc::now());
    }

    pub fn record_outcome_at(&self, key: &str, hit: bool, elapsed: Duration, now: DateTime<Utc>) {
        let elapsed_ms = elapsed.as_secs_f64() * 1_000.0;
        match self.metrics.get_mut(key) {
            Some(mut metric) => metric.record(hit, elapsed_ms, now),
            None => self
                .metrics
                .entry(key.to_string())
                .or_insert_with(|| PerformanceMetric::new(now))
                .record(hit, elapsed_ms, now),
        }
    }

    /// Aggregate hit rate across all keys, as a percentage (0 when nothing
    /// has been recorded)
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.totals();
        percentage(hits, misses)
    }

    /// Summed (hits, misses)
    pub fn totals(&self) -> (u64, u64) {
        self.metrics.iter().fold((0, 0), |(hits, misses), metric| {
            (hits + metric.cache_hits, misses + metric.cache_misses)
        })
    }

    pub fn metric(&self, key: &str) -> Option<PerformanceMetric> {
        self.metrics.get(key).map(|metric| metric.clone())
    }

    /// All metrics, busiest keys first
    pub fn snapshot(&self) -> Vec<(String, PerformanceMetric)> {
        let mut all: Vec<_> = self
            .metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| b.1.total_requests.cmp(&a.1.total_requests).then_with(|| a.0.cmp(&b.0)));
        all
    }

    /// Drop metrics idle longer than the staleness window
    pub fn purge_stale(&self) -> usize {
        self.purge_stale_at(Utc::now())
    }

    pub fn purge_stale_at(&self, now: DateTime<Utc>) -> usize {
        let Ok(window) = chrono::Duration::from_std(self.staleness) else {
            return 0;
        };
        let cutoff = now - window;
        let before = self.metrics.len();
        self.metrics.retain(|_, metric| metric.last_accessed >= cutoff);
        before.saturating_sub(self.metrics.len())
    }

    /// Number of keys tracked
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn clear(&self) {
        self.metrics.clear();
    }
}

impl Default for PerformanceAccountant {
    fn default() -> Self {
        Self::new(DEFAULT_METRIC_STALENESS)
    }
}
