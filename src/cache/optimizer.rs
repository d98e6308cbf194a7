//! Optimization and warmup
//!
//! `optimize` compacts the local tier, drops lapsed index registrations and
//! expired shared entries, and purges stale per-key metrics.
//! `warmup` populates a batch of keys up front. `Optimizer` runs `optimize`
//! periodically until cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::coordinator::TieredCache;
use super::entry::CacheOptions;
use super::local::CompactionReport;

/// Result of one optimize pass
#[derive(Debug, Clone, Default)]
pub struct OptimizeReport {
    pub compaction: CompactionReport,
    pub purged_metrics: usize,
    /// Index registrations whose lifetime had lapsed
    pub pruned_keys: usize,
    /// Expired entries swept from the shared backend
    pub purged_shared: u64,
    /// Hit rate (percentage) after the pass
    pub hit_rate: f64,
    pub elapsed: Duration,
}

/// Result of a warmup batch
#[derive(Debug, Clone, Default)]
pub struct WarmupReport {
    pub loaded: usize,
    /// Keys whose factory failed or whose value could not be stored
    pub failed: Vec<String>,
}

impl WarmupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl TieredCache {
    /// Compact the local tier, prune lapsed index registrations, sweep expired
    /// shared entries and purge metrics idle past the staleness window
    #[instrument(skip(self))]
    pub async fn optimize(&self) -> OptimizeReport {
        let start = Instant::now();

        let compaction = self.local().compact(self.config().compaction_fraction);
        let pruned_keys = self.index().purge_expired();
        let purged_shared = self.shared().purge_expired().await;
        let purged_metrics = self.accountant().purge_stale();

        let report = OptimizeReport {
            compaction,
            purged_metrics,
            pruned_keys,
            purged_shared,
            hit_rate: self.hit_rate(),
            elapsed: start.elapsed(),
        };

        info!(
            expired = report.compaction.expired,
            evicted = report.compaction.evicted,
            purged_metrics = report.purged_metrics,
            pruned_keys = report.pruned_keys,
            purged_shared = report.purged_shared,
            hit_rate = report.hit_rate,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Cache optimization completed"
        );
        report
    }

    /// Run each factory and `set` its value, concurrently. A failing key is
    /// logged and does not abort the batch.
    pub async fn warmup<T, F, Fut>(&self, items: Vec<(String, F)>, options: &CacheOptions) -> WarmupReport
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let total = items.len();
        let results = join_all(items.into_iter().map(|(key, factory)| async move {
            match factory().await {
                Ok(value) => {
                    let outcome = self.set(&key, &value, options).await;
                    if outcome.is_stored() {
                        Ok(key)
                    } else {
                        warn!(key = %key, "Warmup value could not be stored");
                        Err(key)
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Warmup factory failed");
                    Err(key)
                }
            }
        }))
        .await;

        let mut report = WarmupReport::default();
        for result in results {
            match result {
                Ok(_) => report.loaded += 1,
                Err(key) => report.failed.push(key),
            }
        }

        info!(total, loaded = report.loaded, failed = report.failed.len(), "Cache warmup completed");
        report
    }
}

/// Periodic optimizer task
pub struct Optimizer {
    cache: Arc<TieredCache>,
    period: Duration,
}

impl Optimizer {
    pub fn new(cache: Arc<TieredCache>, period: Duration) -> Self {
        Self { cache, period }
    }

    /// Run until `shutdown` is cancelled. The first pass happens one period
    /// after start.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(period_secs = self.period.as_secs(), "Starting cache optimizer");

        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Cache optimizer shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.cache.optimize().await;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
