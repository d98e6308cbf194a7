//! Tiered Cache Coordinator
//!
//! Orchestrates the local and shared tiers: read-through with backfill,
//! write-through to both tiers, get-or-populate under a per-key lock, and
//! tag/pattern invalidation.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::accountant::{PerformanceAccountant, DEFAULT_METRIC_STALENESS};
use super::codec::Codec;
use super::compression::CompressionConfig;
use super::entry::{CacheOptions, ExpirationPolicy, TierOrigin};
use super::index::{GlobPattern, IndexCounts, InvalidationIndex};
use super::local::{LocalTier, LocalTierConfig, LocalTierStats};
use super::population::{Claim, PopulationLocks, Wait, DEFAULT_POPULATION_TIMEOUT};
use super::shared::{
    InMemorySharedBackend, SharedBackend, SharedTier, SharedTierStats, COUNTER_TTL, DEFAULT_CALL_TIMEOUT,
};
use crate::error::{Error, Result};

/// Default upper bound on local-tier lifetimes (5 minutes)
pub const DEFAULT_LOCAL_TTL_CAP: Duration = Duration::from_secs(5 * 60);

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct TieredCacheConfig {
    /// Local tier configuration
    pub local: LocalTierConfig,
    /// Longest lifetime any local entry gets, whatever the caller asked for
    pub local_ttl_cap: Duration,
    /// Per-call shared tier timeout
    pub shared_timeout: Duration,
    /// Ceiling on one population, for the leader and its waiters
    pub population_timeout: Duration,
    /// Idle time after which per-key metrics are purged
    pub metric_staleness: Duration,
    /// Fraction of live local entries dropped by each optimize pass
    pub compaction_fraction: f64,
    /// Local frame compression
    pub compression: CompressionConfig,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            local: LocalTierConfig::default(),
            local_ttl_cap: DEFAULT_LOCAL_TTL_CAP,
            shared_timeout: DEFAULT_CALL_TIMEOUT,
            population_timeout: DEFAULT_POPULATION_TIMEOUT,
            metric_staleness: DEFAULT_METRIC_STALENESS,
            compaction_fraction: 0.25,
            compression: CompressionConfig::default(),
        }
    }
}

/// Which tiers accepted a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub local: bool,
    pub shared: bool,
}

impl WriteOutcome {
    /// Every tier asked to store the value did so
    pub fn is_complete(&self, used_local: bool) -> bool {
        self.shared && (self.local || !used_local)
    }

    /// At least one tier holds the value
    pub fn is_stored(&self) -> bool {
        self.local || self.shared
    }
}

/// Aggregate statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub local: LocalTierStats,
    pub shared: SharedTierStats,
    /// Aggregate hit rate (percentage)
    pub hit_rate: f64,
    pub tracked_keys: usize,
    pub index: IndexCounts,
    pub in_flight_populations: usize,
}

/// Two-tier cache
pub struct TieredCache {
    local: LocalTier,
    shared: SharedTier,
    codec: Codec,
    index: InvalidationIndex,
    accountant: Arc<PerformanceAccountant>,
    population: PopulationLocks,
    config: TieredCacheConfig,
}

impl TieredCache {
    /// Create a cache over `backend` with default configuration
    pub fn new(backend: Arc<dyn SharedBackend>) -> Self {
        Self::with_config(TieredCacheConfig::default(), backend)
    }

    pub fn with_config(config: TieredCacheConfig, backend: Arc<dyn SharedBackend>) -> Self {
        let accountant = Arc::new(PerformanceAccountant::new(config.metric_staleness));
        Self::with_accountant(config, backend, accountant)
    }

    /// Create a cache recording into an existing accountant
    pub fn with_accountant(
        config: TieredCacheConfig,
        backend: Arc<dyn SharedBackend>,
        accountant: Arc<PerformanceAccountant>,
    ) -> Self {
        Self {
            local: LocalTier::with_config(config.local.clone()),
            shared: SharedTier::with_backend_timeout(backend, config.shared_timeout),
            codec: Codec::with_compression(config.compression.clone()),
            index: InvalidationIndex::new(),
            accountant,
            population: PopulationLocks::new(config.population_timeout),
            config,
        }
    }

    /// Create with an in-process shared backend (single node, tests)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySharedBackend::new()))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a value, checking the local tier before the shared tier
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with_origin(key).await.map(|(value, _)| value)
    }

    /// Get a value along with the tier that served it
    pub async fn get_with_origin<T: DeserializeOwned>(&self, key: &str) -> Option<(T, TierOrigin)> {
        let start = Instant::now();
        let backfill = ExpirationPolicy::absolute(self.config.local_ttl_cap);
        let found = self.lookup(key, backfill).await;
        self.accountant
            .record_outcome(key, found.is_some(), start.elapsed());
        found
    }

    /// Local tier, then shared tier with backfill. Tier and codec failures
    /// are logged and read as a miss.
    async fn lookup<T: DeserializeOwned>(
        &self,
        key: &str,
        backfill: ExpirationPolicy,
    ) -> Option<(T, TierOrigin)> {
        if let Some(frame) = self.local.get(key) {
            match self.codec.decode_frame(&frame) {
                Ok(value) => return Some((value, TierOrigin::Local)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Dropping undecodable local entry");
                    self.local.remove(key);
                }
            }
        }

        let payload = self.shared.get_string(key).await?;
        let value = match self.codec.decode_string(&payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Undecodable shared entry treated as miss");
                return None;
            }
        };

        self.backfill(key, &payload, backfill);
        Some((value, TierOrigin::Shared))
    }

    fn backfill(&self, key: &str, payload: &str, policy: ExpirationPolicy) {
        let policy = policy.capped(self.config.local_ttl_cap);
        match self.codec.frame_from_string(payload) {
            Ok(frame) => {
                if self.local.insert(key, frame, policy, TierOrigin::Shared) {
                    self.index.register_key(key, policy.duration);
                    tracing::trace!(key = %key, ttl_ms = policy.duration.as_millis() as u64, "Backfilled local tier");
                }
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "Backfill framing failed"),
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.local.contains(key) || self.shared.exists(key).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a value to both tiers. Best-effort: the outcome says which tiers
    /// accepted it.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &CacheOptions) -> WriteOutcome {
        match self.codec.encode_string(value) {
            Ok(payload) => self.write_payload(key, payload, options).await,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Value not cached: serialization failed");
                WriteOutcome::default()
            }
        }
    }

    async fn write_payload(&self, key: &str, payload: String, options: &CacheOptions) -> WriteOutcome {
        let policy = options.policy();
        if policy.duration.is_zero() {
            tracing::debug!(key = %key, "Zero expiration, value not cached");
            return WriteOutcome::default();
        }

        // Local first so a following get on this node observes the write
        let local = if options.use_local_tier {
            match self.codec.frame_from_string(&payload) {
                Ok(frame) => self.local.insert(
                    key,
                    frame,
                    policy.capped(self.config.local_ttl_cap),
                    TierOrigin::Local,
                ),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Local framing failed");
                    false
                }
            }
        } else {
            self.local.remove(key);
            false
        };

        let shared = self.shared.set_string(key, payload, policy).await;

        let outcome = WriteOutcome { local, shared };
        if outcome.is_stored() {
            self.index.register_with_policy(key, &options.tags, policy);
        }
        if !outcome.is_complete(options.use_local_tier) {
            tracing::debug!(key = %key, local, shared, "Partial cache write");
        }
        outcome
    }

    /// Return the cached value, or run `factory` once across all concurrent
    /// callers for `key` and cache its result.
    ///
    /// Factory failures and population timeouts are returned to every caller
    /// waiting on the key; nothing is cached for them.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F, options: &CacheOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let start = Instant::now();
        let backfill = options.policy();

        if let Some((value, _)) = self.lookup::<T>(key, backfill).await {
            self.accountant.record_outcome(key, true, start.elapsed());
            return Ok(value);
        }

        let mut factory = Some(factory);
        let result: Result<T> = loop {
            match self.population.claim(key) {
                Claim::Leader(guard) => {
                    // A previous leader may have finished between our miss and the claim
                    if let Some((value, _)) = self.lookup::<T>(key, backfill).await {
                        drop(guard);
                        break Ok(value);
                    }

                    let Some(factory) = factory.take() else {
                        break Err(Error::Internal("factory already consumed".into()));
                    };

                    match tokio::time::timeout(self.population.ceiling(), factory()).await {
                        Ok(Ok(value)) => {
                            match self.codec.encode_string(&value) {
                                Ok(payload) => {
                                    let shared: Arc<str> = Arc::from(payload.as_str());
                                    self.write_payload(key, payload, options).await;
                                    guard.complete(Ok(shared));
                                }
                                Err(e) => {
                                    tracing::warn!(key = %key, error = %e, "Factory value not cached: serialization failed");
                                    guard.complete(Err(e));
                                }
                            }
                            tracing::debug!(key = %key, "Populated key");
                            break Ok(value);
                        }
                        Ok(Err(e)) => {
                            let e = Error::factory(key, e);
                            tracing::debug!(key = %key, error = %e, "Population failed");
                            guard.complete(Err(e.clone()));
                            break Err(e);
                        }
                        Err(_) => {
                            let e = self.population.timeout_error(key);
                            tracing::warn!(key = %key, error = %e, "Factory exceeded population timeout");
                            guard.complete(Err(e.clone()));
                            break Err(e);
                        }
                    }
                }
                Claim::Follower(receiver) => match self.population.wait(key, receiver).await {
                    Wait::Done(Ok(payload)) => break self.codec.decode_string(&payload),
                    Wait::Done(Err(e)) => break Err(e),
                    Wait::Abandoned => continue,
                },
            }
        };

        self.accountant.record_outcome(key, false, start.elapsed());
        result
    }

    /// Add `delta` to a shared counter; `None` when the update was not applied
    pub async fn increment(&self, key: &str, delta: i64) -> Option<i64> {
        self.local.remove(key);
        let value = self.shared.increment(key, delta).await;
        if value.is_some() {
            self.index.register_key(key, COUNTER_TTL);
        }
        value
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Option<i64> {
        self.increment(key, delta.saturating_neg()).await
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove a key from both tiers and the index
    pub async fn remove(&self, key: &str) -> bool {
        let local = self.local.remove(key);
        let shared = self.shared.remove(key).await;
        self.index.unregister(key);
        local || shared
    }

    /// Remove every key carrying `tag` from both tiers, then the tag itself.
    /// Unknown tags are a no-op.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let keys: Vec<String> = self.index.take_tag(tag).into_iter().collect();
        if keys.is_empty() {
            return 0;
        }

        for key in &keys {
            self.local.remove(key);
        }
        let removed = self.shared.remove_many(&keys).await;

        tracing::info!(tag = %tag, keys = keys.len(), shared_removed = removed, "Invalidated tag");
        keys.len()
    }

    /// Remove every key matching a glob (`*`, `?`).
    ///
    /// Candidates come from the key registry, plus a backend scan when the
    /// shared backend supports enumeration.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize> {
        let glob = GlobPattern::new(pattern)?;

        let mut keys: BTreeSet<String> = self.index.keys_matching(&glob).into_iter().collect();
        if let Some(scanned) = self.shared.scan_keys(glob.as_str()).await {
            keys.extend(scanned.into_iter().filter(|k| glob.matches(k)));
        }
        if keys.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = keys.into_iter().collect();
        for key in &keys {
            self.local.remove(key);
            self.index.unregister(key);
        }
        let removed = self.shared.remove_many(&keys).await;

        tracing::info!(pattern = %glob, keys = keys.len(), shared_removed = removed, "Invalidated pattern");
        Ok(keys.len())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    pub fn shared(&self) -> &SharedTier {
        &self.shared
    }

    pub fn index(&self) -> &InvalidationIndex {
        &self.index
    }

    pub fn accountant(&self) -> &Arc<PerformanceAccountant> {
        &self.accountant
    }

    pub fn population(&self) -> &PopulationLocks {
        &self.population
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn config(&self) -> &TieredCacheConfig {
        &self.config
    }

    /// Aggregate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        self.accountant.hit_rate()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local: self.local.stats(),
            shared: self.shared.stats(),
            hit_rate: self.accountant.hit_rate(),
            tracked_keys: self.accountant.len(),
            index: self.index.counts(),
            in_flight_populations: self.population.in_flight(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
    }

    fn alice() -> Profile {
        Profile { name: "Alice".into() }
    }

    fn cache_with_backend() -> (TieredCache, Arc<InMemorySharedBackend>) {
        let backend = Arc::new(InMemorySharedBackend::new());
        (TieredCache::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_set_then_get_is_served_locally() {
        let (cache, _) = cache_with_backend();
        let outcome = cache.set("user:42:profile", &alice(), &CacheOptions::default()).await;
        assert_eq!(outcome, WriteOutcome { local: true, shared: true });

        let (value, origin) = cache.get_with_origin::<Profile>("user:42:profile").await.unwrap();
        assert_eq!(value, alice());
        assert_eq!(origin, TierOrigin::Local);
    }

    #[tokio::test]
    async fn test_get_backfills_from_shared() {
        let (cache, backend) = cache_with_backend();
        backend
            .set("k", "{\"name\":\"Alice\"}".into(), ExpirationPolicy::absolute(Duration::from_secs(3600)))
            .await
            .unwrap();

        let (_, origin) = cache.get_with_origin::<Profile>("k").await.unwrap();
        assert_eq!(origin, TierOrigin::Shared);
        let (_, origin) = cache.get_with_origin::<Profile>("k").await.unwrap();
        assert_eq!(origin, TierOrigin::Local);

        assert_eq!(cache.local().get_entry("k").unwrap().origin(), TierOrigin::Shared);
        assert!(cache.local().remaining_ttl("k").unwrap() <= DEFAULT_LOCAL_TTL_CAP);
        assert!(cache.index().is_registered("k"));
    }

    #[tokio::test]
    async fn test_undecodable_shared_value_is_a_miss() {
        let (cache, backend) = cache_with_backend();
        backend
            .set("k", "not json".into(), ExpirationPolicy::absolute(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(cache.get::<Profile>("k").await, None);
        assert!(cache.local().is_empty());
    }

    #[tokio::test]
    async fn test_shared_only_drops_stale_local_copy() {
        let (cache, backend) = cache_with_backend();
        cache.set("k", &1, &CacheOptions::default()).await;
        assert!(cache.local().contains("k"));

        let outcome = cache.set("k", &2, &CacheOptions::new().shared_only()).await;
        assert_eq!(outcome, WriteOutcome { local: false, shared: true });
        assert!(outcome.is_complete(false));
        assert!(!cache.local().contains("k"));
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_zero_expiration_is_not_cached() {
        let (cache, _) = cache_with_backend();
        let options = CacheOptions::new().with_expiration(Duration::ZERO);
        assert_eq!(cache.set("k", &1, &options).await, WriteOutcome::default());
        assert_eq!(cache.get::<i32>("k").await, None);
    }

    #[tokio::test]
    async fn test_get_or_set_runs_factory_on_miss_only() {
        let (cache, _) = cache_with_backend();
        let options = CacheOptions::default();

        let value: Profile = cache
            .get_or_set("k", || async { Ok(alice()) }, &options)
            .await
            .unwrap();
        assert_eq!(value, alice());

        let again: Profile = cache
            .get_or_set("k", || async { anyhow::bail!("must not run") }, &options)
            .await
            .unwrap();
        assert_eq!(again, alice());

        let metric = cache.accountant().metric("k").unwrap();
        assert_eq!((metric.cache_hits, metric.cache_misses), (1, 1));
    }

    #[tokio::test]
    async fn test_factory_error_propagates_and_is_not_cached() {
        let (cache, _) = cache_with_backend();
        let result: Result<i32> = cache
            .get_or_set("k", || async { anyhow::bail!("database unavailable") }, &CacheOptions::default())
            .await;

        assert_matches!(result, Err(Error::Factory { ref key, .. }) if key == "k");
        assert!(cache.get::<i32>("k").await.is_none());
        assert_eq!(cache.population().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_remove_clears_both_tiers_and_index() {
        let (cache, backend) = cache_with_backend();
        cache.set("k", &1, &CacheOptions::new().with_tag("t")).await;

        assert!(cache.remove("k").await);
        assert!(!cache.exists("k").await);
        assert!(!backend.exists("k").await.unwrap());
        assert!(cache.index().keys_for_tag("t").is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_unknown_tag_is_noop() {
        let (cache, _) = cache_with_backend();
        assert_eq!(cache.invalidate_by_tag("nothing").await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let (cache, backend) = cache_with_backend();
        for key in ["user:1:profile", "user:2:profile", "user:1:orders"] {
            cache.set(key, &1, &CacheOptions::default()).await;
        }
        // Written by another node: only the backend scan can find it
        backend
            .set("user:3:profile", "1".into(), ExpirationPolicy::absolute(Duration::from_secs(60)))
            .await
            .unwrap();

        let removed = cache.invalidate_by_pattern("user:*:profile").await.unwrap();
        assert_eq!(removed, 3);
        assert!(cache.get::<i32>("user:1:profile").await.is_none());
        assert!(cache.get::<i32>("user:3:profile").await.is_none());
        assert_eq!(cache.get::<i32>("user:1:orders").await, Some(1));

        assert_matches!(
            cache.invalidate_by_pattern("").await,
            Err(Error::InvalidPattern { .. })
        );
    }

    #[tokio::test]
    async fn test_counters_bypass_local_tier() {
        let (cache, _) = cache_with_backend();
        assert_eq!(cache.increment("visits", 3).await, Some(3));
        assert_eq!(cache.decrement("visits", 1).await, Some(2));
        assert_eq!(cache.get::<i64>("visits").await, Some(2));

        assert_eq!(cache.increment("visits", 1).await, Some(3));
        assert_eq!(cache.get::<i64>("visits").await, Some(3));
    }

    #[tokio::test]
    async fn test_stats_aggregate() {
        let (cache, _) = cache_with_backend();
        cache.set("k", &1, &CacheOptions::new().with_tag("t")).await;
        cache.get::<i32>("k").await;
        cache.get::<i32>("missing").await;

        let stats = cache.stats();
        assert_eq!(stats.hit_rate, 50.0);
        assert_eq!(stats.tracked_keys, 2);
        assert_eq!(stats.local.entries, 1);
        assert_eq!(stats.shared.backend, "memory");
        assert_eq!(stats.index.tags, 1);
        assert_eq!(stats.in_flight_populations, 0);
    }
}
