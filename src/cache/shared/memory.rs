//! In-process shared backend
//!
//! Backs the shared tier with a `DashMap` when no distributed cache is
//! configured, and in tests. Expiry follows tokio's clock so paused-time tests
//! can drive it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{SharedBackend, COUNTER_TTL};
use crate::cache::entry::{expires_after, ExpirationPolicy};
use crate::cache::index::GlobPattern;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
    sliding: Option<Duration>,
}

impl StoredValue {
    fn new(value: String, policy: ExpirationPolicy, now: Instant) -> Self {
        Self {
            value,
            expires_at: expires_after(now, policy.duration),
            sliding: policy.is_sliding().then_some(policy.duration),
        }
    }

    #[inline]
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory backend statistics
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackendStats {
    pub entries: usize,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// In-memory shared backend
#[derive(Debug, Default)]
pub struct InMemorySharedBackend {
    storage: DashMap<String, StoredValue>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemorySharedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left on a live key
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.storage
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.expires_at - now)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.storage.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> InMemoryBackendStats {
        InMemoryBackendStats {
            entries: self.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.storage.len();
        self.storage.retain(|_, stored| stored.is_live(now));
        before.saturating_sub(self.storage.len())
    }

    /// Entries held, expired or not
    pub fn stored_entries(&self) -> usize {
        self.storage.len()
    }

    fn drop_expired(&self, key: &str, now: Instant) {
        self.storage.remove_if(key, |_, stored| !stored.is_live(now));
    }
}

#[async_trait]
impl SharedBackend for InMemorySharedBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let found = match self.storage.get_mut(key) {
            Some(mut stored) if stored.is_live(now) => {
                if let Some(window) = stored.sliding {
                    stored.expires_at = expires_after(now, window);
                }
                Some(stored.value.clone())
            }
            _ => None,
        };

        if found.is_none() {
            self.drop_expired(key, now);
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: String, policy: ExpirationPolicy) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if policy.duration.is_zero() {
            self.storage.remove(key);
            return Ok(());
        }
        self.storage
            .insert(key.to_string(), StoredValue::new(value, policy, Instant::now()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(self
            .storage
            .remove(key)
            .map(|(_, stored)| stored.is_live(now))
            .unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .storage
            .get(key)
            .map(|stored| stored.is_live(now))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let applied = match self.storage.get_mut(key) {
            Some(mut stored) if stored.is_live(now) => {
                stored.expires_at = expires_after(now, ttl);
                true
            }
            _ => false,
        };
        Ok(applied)
    }

    /// Atomic per key: the update happens under the map's entry lock
    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let mut stored = self.storage.entry(key.to_string()).or_insert_with(|| {
            StoredValue::new("0".into(), ExpirationPolicy::absolute(COUNTER_TTL), now)
        });
        if !stored.is_live(now) {
            *stored = StoredValue::new("0".into(), ExpirationPolicy::absolute(COUNTER_TTL), now);
        }

        let current: i64 = stored.value.trim().parse().map_err(|e| {
            Error::Serialization(format!("value under {} is not an integer: {}", key, e))
        })?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::Backend(format!("counter {} would overflow", key)))?;
        stored.value = next.to_string();
        Ok(next)
    }

    async fn purge_expired(&self) -> Result<u64> {
        Ok(InMemorySharedBackend::purge_expired(self) as u64)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Option<Vec<String>>> {
        let glob = GlobPattern::new(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .storage
            .iter()
            .filter(|e| e.is_live(now) && glob.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(Some(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn absolute(secs: u64) -> ExpirationPolicy {
        ExpirationPolicy::absolute(Duration::from_secs(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_expiry() {
        let backend = InMemorySharedBackend::new();
        backend.set("k", "v".into(), absolute(3600)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(backend.remaining_ttl("k"), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_refresh_on_read() {
        let backend = InMemorySharedBackend::new();
        backend
            .set("k", "v".into(), ExpirationPolicy::sliding(Duration::from_secs(10)))
            .await
            .unwrap();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(9)).await;
            assert!(backend.get("k").await.unwrap().is_some());
        }
        assert_eq!(backend.remaining_ttl("k"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_expiration_is_stored() {
        let backend = InMemorySharedBackend::new();
        backend
            .set("forever", "v".into(), ExpirationPolicy::absolute(Duration::MAX))
            .await
            .unwrap();
        assert!(backend.expire("forever", Duration::MAX).await.unwrap());

        tokio::time::advance(Duration::from_secs(10 * 365 * 24 * 3600)).await;
        assert_eq!(backend.get("forever").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_unread_expired_entries() {
        let backend = InMemorySharedBackend::new();
        for i in 0..100 {
            backend.set(&format!("k{}", i), "v".into(), absolute(1)).await.unwrap();
        }
        backend.set("kept", "v".into(), absolute(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(backend.stored_entries(), 101);

        assert_eq!(SharedBackend::purge_expired(&backend).await.unwrap(), 100);
        assert_eq!(backend.stored_entries(), 1);
        assert!(backend.exists("kept").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_resets_lifetime() {
        let backend = InMemorySharedBackend::new();
        backend.set("k", "v".into(), absolute(5)).await.unwrap();

        assert!(backend.expire("k", Duration::from_secs(60)).await.unwrap());
        assert!(!backend.expire("missing", Duration::from_secs(60)).await.unwrap());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_is_atomic_per_key() {
        let backend = std::sync::Arc::new(InMemorySharedBackend::new());
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let backend = backend.clone();
                tokio::spawn(async move { backend.increment("counter", 2).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(backend.get("counter").await.unwrap().as_deref(), Some("100"));
        assert!(backend.remaining_ttl("counter").unwrap() <= COUNTER_TTL);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let backend = InMemorySharedBackend::new();
        backend.set("k", "\"text\"".into(), absolute(60)).await.unwrap();
        let err = backend.increment("k", 1).await.unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_scan_keys_matches_glob() {
        let backend = InMemorySharedBackend::new();
        for key in ["user:1", "user:2", "user:10", "order:1"] {
            backend.set(key, "v".into(), absolute(60)).await.unwrap();
        }

        let keys = backend.scan_keys("user:?").await.unwrap().unwrap();
        assert_eq!(keys, vec!["user:1".to_string(), "user:2".to_string()]);

        let keys = backend.scan_keys("*:1").await.unwrap().unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_stats() {
        let backend = InMemorySharedBackend::new();
        backend.set("k", "v".into(), absolute(60)).await.unwrap();
        backend.get("k").await.unwrap();
        backend.get("missing").await.unwrap();
        assert!(backend.remove("k").await.unwrap());

        let stats = backend.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.deletes, 1);
    }
}
