//! Local Tier - In-Process Cache
//!
//! Per-process key/value store of serialized frames with per-entry expiration.
//!
//! # Design
//!
//! - Sharded map for low read contention
//! - Every entry carries a finite deadline; non-expiring entries are refused
//! - Capacity bounded by entry count and bytes, with high/low watermark
//!   eviction on insert (idle time over access frequency)
//! - Explicit `compact(fraction)` used by the optimizer

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::entry::{CacheEntry, ExpirationPolicy, TierOrigin};
use super::shard::ShardedMap;

/// Local tier configuration
#[derive(Debug, Clone)]
pub struct LocalTierConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total size of stored frames in bytes
    pub capacity_bytes: u64,
    /// Fraction of either limit that triggers eviction
    pub high_watermark: f64,
    /// Fraction of either limit eviction stops at
    pub low_watermark: f64,
    /// Upper bound on entries evicted by one insert
    pub eviction_batch_size: usize,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            capacity_bytes: 256 * 1024 * 1024,
            high_watermark: 0.90,
            low_watermark: 0.75,
            eviction_batch_size: 1_000,
        }
    }
}

/// Outcome of a compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Entries dropped because their deadline had passed
    pub expired: usize,
    /// Live entries dropped to satisfy the requested fraction
    pub evicted: usize,
}

impl CompactionReport {
    pub fn total(&self) -> usize {
        self.expired + self.evicted
    }
}

/// In-process cache tier
pub struct LocalTier {
    storage: ShardedMap<CacheEntry>,
    config: LocalTierConfig,
    epoch: Instant,
    current_size: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalTier {
    /// Create a local tier with default configuration
    pub fn new() -> Self {
        Self::with_config(LocalTierConfig::default())
    }

    /// Create a local tier with custom configuration
    pub fn with_config(config: LocalTierConfig) -> Self {
        Self {
            storage: ShardedMap::new(),
            config,
            epoch: Instant::now(),
            current_size: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Milliseconds on this tier's clock
    #[inline]
    fn now_ms(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Get a live entry's frame, refreshing sliding deadlines
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_entry(key).map(|entry| entry.value().clone())
    }

    /// Get a live entry
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = self.now_ms();
        match self.storage.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.metadata().touch(now);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                self.drop_if_expired(key, now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a frame. Returns false if the entry was refused (zero lifetime or
    /// larger than the whole tier).
    pub fn insert(&self, key: &str, value: Bytes, policy: ExpirationPolicy, origin: TierOrigin) -> bool {
        if policy.duration.is_zero() {
            tracing::debug!(key = %key, "refusing local entry without a finite lifetime");
            return false;
        }

        let size = value.len() as u64;
        if size > self.config.capacity_bytes {
            tracing::debug!(key = %key, size, "entry larger than local tier capacity");
            return false;
        }

        if self.should_evict(size) {
            self.evict();
        }

        let entry = CacheEntry::new(key, value, origin, policy, self.now_ms());
        match self.storage.insert(key.to_string(), entry) {
            Some(old) => {
                let old_size = old.size();
                if size > old_size {
                    self.current_size.fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.current_size.fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.current_size.fetch_add(size, Ordering::Relaxed);
            }
        }
        true
    }

    /// Remove an entry. Returns true if one was present.
    pub fn remove(&self, key: &str) -> bool {
        match self.storage.remove(key) {
            Some(entry) => {
                self.current_size.fetch_sub(entry.size(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Check for a live entry without touching it
    pub fn contains(&self, key: &str) -> bool {
        let now = self.now_ms();
        self.storage
            .with(key, |entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// Time left before a live entry expires
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = self.now_ms();
        self.storage
            .with(key, |entry| {
                (!entry.is_expired(now)).then(|| entry.metadata().remaining(now))
            })
            .flatten()
    }

    fn drop_if_expired(&self, key: &str, now: u64) {
        if let Some(entry) = self.storage.remove_if(key, |e| e.is_expired(now)) {
            self.current_size.fetch_sub(entry.size(), Ordering::Relaxed);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = self.now_ms();
        let removed = self.storage.retain(|_, entry| !entry.is_expired(now));
        self.account_removed(&removed);
        self.expirations.fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed.len()
    }

    /// Drop expired entries, then the least recently used `fraction` of what
    /// remains.
    pub fn compact(&self, fraction: f64) -> CompactionReport {
        let expired = self.purge_expired();

        let fraction = fraction.clamp(0.0, 1.0);
        let target = (self.storage.len() as f64 * fraction).ceil() as usize;
        if target == 0 {
            return CompactionReport { expired, evicted: 0 };
        }

        let mut candidates: Vec<(String, u64)> = self
            .storage
            .snapshot()
            .into_iter()
            .map(|(key, entry)| (key, entry.metadata().last_access_ms()))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);

        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(target) {
            if self.remove(&key) {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);

        CompactionReport { expired, evicted }
    }

    fn account_removed(&self, removed: &[CacheEntry]) {
        let bytes: u64 = removed.iter().map(CacheEntry::size).sum();
        self.current_size.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn should_evict(&self, incoming: u64) -> bool {
        let bytes = (self.size() + incoming) as f64 / self.config.capacity_bytes as f64;
        let entries = (self.len() + 1) as f64 / self.config.max_entries as f64;
        bytes > self.config.high_watermark || entries > self.config.high_watermark
    }

    fn above_low_watermark(&self) -> bool {
        let bytes = self.size() as f64 / self.config.capacity_bytes as f64;
        let entries = self.len() as f64 / self.config.max_entries as f64;
        bytes > self.config.low_watermark || entries > self.config.low_watermark
    }

    /// Evict entries until the low watermark is reached
    fn evict(&self) {
        let expired = self.purge_expired();
        if expired > 0 && !self.above_low_watermark() {
            return;
        }

        let now = self.now_ms();
        let mut candidates: Vec<(String, f64)> = self
            .storage
            .snapshot()
            .into_iter()
            .map(|(key, entry)| {
                let score = entry.metadata().eviction_score(now);
                (key, score)
            })
            .collect();

        // Highest score first = most evictable
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0;
        for (key, _) in candidates {
            if !self.above_low_watermark() || evicted >= self.config.eviction_batch_size {
                break;
            }
            if self.remove(&key) {
                evicted += 1;
            }
        }

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        tracing::debug!(evicted, expired, entries = self.len(), "local tier eviction");
    }

    /// Current size in bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn clear(&self) {
        self.storage.clear();
        self.current_size.store(0, Ordering::Relaxed);
    }

    pub fn config(&self) -> &LocalTierConfig {
        &self.config
    }

    /// Get tier statistics
    pub fn stats(&self) -> LocalTierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        LocalTierStats {
            entries: self.len(),
            size_bytes: self.size(),
            capacity_bytes: self.config.capacity_bytes,
            hits,
            misses,
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new()
    }
}

/// Local tier statistics
#[derive(Debug, Clone, Default)]
pub struct LocalTierStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    pub evictions: u64,
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================
