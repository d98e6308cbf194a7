//! Cache Entry Types
//!
//! Entries, expiration policies and the per-call options callers pass to the
//! coordinator.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Default expiration applied when the caller does not choose one (15 minutes)
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(15 * 60);

/// Longest lifetime any tier is asked to hold a value (100 years)
pub const MAX_EXPIRATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Deadline `duration` after `now`, with the duration clamped to `MAX_EXPIRATION`
pub fn expires_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration.min(MAX_EXPIRATION)).unwrap_or(now)
}

/// Which tier produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierOrigin {
    /// Written directly into the local tier by a `set`
    Local,
    /// Backfilled from the shared tier after a hit
    Shared,
}

impl std::fmt::Display for TierOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierOrigin::Local => write!(f, "local"),
            TierOrigin::Shared => write!(f, "shared"),
        }
    }
}

// =============================================================================
// Expiration Policy
// =============================================================================

/// How an entry's deadline is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpirationKind {
    /// Deadline fixed at write time
    Absolute,
    /// Deadline pushed forward on every successful read
    Sliding,
}

/// Expiration policy: a kind plus a finite duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpirationPolicy {
    pub kind: ExpirationKind,
    pub duration: Duration,
}

impl ExpirationPolicy {
    pub fn absolute(duration: Duration) -> Self {
        Self {
            kind: ExpirationKind::Absolute,
            duration: duration.min(MAX_EXPIRATION),
        }
    }

    pub fn sliding(duration: Duration) -> Self {
        Self {
            kind: ExpirationKind::Sliding,
            duration: duration.min(MAX_EXPIRATION),
        }
    }

    #[inline]
    pub fn is_sliding(&self) -> bool {
        self.kind == ExpirationKind::Sliding
    }

    /// Local-tier form of this policy: an absolute deadline no later than
    /// `cap`. Sliding windows are not carried over, so local reads can never
    /// keep an entry alive past the cap.
    pub fn capped(self, cap: Duration) -> Self {
        Self::absolute(self.duration.min(cap))
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::absolute(DEFAULT_EXPIRATION)
    }
}

// =============================================================================
// Cache Options
// =============================================================================

/// Caller-supplied options for `set` and `get_or_set`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Lifetime of the shared-tier entry (the local tier caps it further)
    pub expiration: Duration,
    /// Refresh the deadline on every read instead of fixing it at write time
    pub sliding_expiration: bool,
    /// Tags the key is registered under for bulk invalidation
    pub tags: BTreeSet<String>,
    /// Write the value into the local tier as well as the shared tier
    pub use_local_tier: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            expiration: DEFAULT_EXPIRATION,
            sliding_expiration: false,
            tags: BTreeSet::new(),
            use_local_tier: true,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn sliding(mut self) -> Self {
        self.sliding_expiration = true;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Keep the value out of the local tier
    pub fn shared_only(mut self) -> Self {
        self.use_local_tier = false;
        self
    }

    /// Expiration policy the options describe
    pub fn policy(&self) -> ExpirationPolicy {
        if self.sliding_expiration {
            ExpirationPolicy::sliding(self.expiration)
        } else {
            ExpirationPolicy::absolute(self.expiration)
        }
    }
}

// =============================================================================
// Entry Metadata
// =============================================================================

/// Mutable bookkeeping for a local-tier entry.
///
/// Times are milliseconds on the owning tier's clock. The struct is shared
/// behind an `Arc` so every clone of an entry observes the same deadline.
#[derive(Debug)]
pub struct EntryMetadata {
    size: u64,
    created_at_ms: u64,
    expires_at_ms: AtomicU64,
    sliding_ms: Option<u64>,
    last_access_ms: AtomicU64,
    access_count: AtomicU32,
}

impl EntryMetadata {
    /// Create metadata for an entry written at `now_ms`
    pub fn new(size: u64, now_ms: u64, policy: ExpirationPolicy) -> Self {
        let ttl_ms = u64::try_from(policy.duration.as_millis()).unwrap_or(u64::MAX);
        Self {
            size,
            created_at_ms: now_ms,
            expires_at_ms: AtomicU64::new(now_ms.saturating_add(ttl_ms)),
            sliding_ms: policy.is_sliding().then_some(ttl_ms),
            last_access_ms: AtomicU64::new(now_ms),
            access_count: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    #[inline]
    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_sliding(&self) -> bool {
        self.sliding_ms.is_some()
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }

    /// Time left before expiry
    pub fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms().saturating_sub(now_ms))
    }

    /// Record a successful read; sliding entries get a fresh deadline
    pub fn touch(&self, now_ms: u64) -> u32 {
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
        if let Some(window) = self.sliding_ms {
            self.expires_at_ms
                .fetch_max(now_ms.saturating_add(window), Ordering::AcqRel);
        }
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Eviction score (higher = more evictable): idle time over frequency
    pub fn eviction_score(&self, now_ms: u64) -> f64 {
        let idle = now_ms.saturating_sub(self.last_access_ms()) as f64;
        idle / (self.access_count() as f64 + 1.0)
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A serialized value held by the local tier
#[derive(Clone)]
pub struct CacheEntry {
    key: Arc<str>,
    value: Bytes,
    origin: TierOrigin,
    metadata: Arc<EntryMetadata>,
}

impl CacheEntry {
    pub fn new(
        key: &str,
        value: Bytes,
        origin: TierOrigin,
        policy: ExpirationPolicy,
        now_ms: u64,
    ) -> Self {
        let metadata = EntryMetadata::new(value.len() as u64, now_ms, policy);
        Self {
            key: Arc::from(key),
            value,
            origin,
            metadata: Arc::new(metadata),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialized value (zero-copy)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn origin(&self) -> TierOrigin {
        self.origin
    }

    #[inline]
    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.metadata.size()
    }

    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.metadata.is_expired(now_ms)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size", &self.size())
            .field("origin", &self.origin)
            .field("expires_at_ms", &self.metadata.expires_at_ms())
            .field("access_count", &self.metadata.access_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = CacheOptions::default();
        assert_eq!(options.expiration, Duration::from_secs(900));
        assert!(!options.sliding_expiration);
        assert!(options.tags.is_empty());
        assert!(options.use_local_tier);
        assert_eq!(options.policy(), ExpirationPolicy::absolute(DEFAULT_EXPIRATION));
    }

    #[test]
    fn test_options_builder() {
        let options = CacheOptions::new()
            .with_expiration(Duration::from_secs(60))
            .sliding()
            .with_tag("users")
            .with_tags(["profiles", "users"])
            .shared_only();

        assert_eq!(options.tags.len(), 2);
        assert!(!options.use_local_tier);
        assert_eq!(options.policy(), ExpirationPolicy::sliding(Duration::from_secs(60)));
    }

    #[test]
    fn test_capped_policy_is_absolute() {
        let capped = ExpirationPolicy::sliding(Duration::from_secs(3600)).capped(Duration::from_secs(300));
        assert_eq!(capped, ExpirationPolicy::absolute(Duration::from_secs(300)));

        let short = ExpirationPolicy::sliding(Duration::from_secs(10)).capped(Duration::from_secs(300));
        assert_eq!(short, ExpirationPolicy::absolute(Duration::from_secs(10)));
    }

    #[test]
    fn test_huge_expiration_is_clamped() {
        let policy = CacheOptions::new().with_expiration(Duration::MAX).policy();
        assert_eq!(policy.duration, MAX_EXPIRATION);

        let meta = EntryMetadata::new(1, 5, ExpirationPolicy { kind: ExpirationKind::Absolute, duration: Duration::MAX });
        assert_eq!(meta.expires_at_ms(), u64::MAX);
        assert!(!meta.is_expired(u64::MAX - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_never_overflows() {
        let now = Instant::now();
        assert_eq!(expires_after(now, Duration::from_secs(1)), now + Duration::from_secs(1));
        assert_eq!(expires_after(now, Duration::MAX), now + MAX_EXPIRATION);
    }

    #[test]
    fn test_absolute_metadata_expiry() {
        let meta = EntryMetadata::new(10, 1_000, ExpirationPolicy::absolute(Duration::from_secs(1)));
        assert!(!meta.is_expired(1_999));
        assert!(meta.is_expired(2_000));

        // Reads do not move an absolute deadline
        meta.touch(1_900);
        assert_eq!(meta.expires_at_ms(), 2_000);
        assert_eq!(meta.remaining(1_500), Duration::from_millis(500));
    }

    #[test]
    fn test_sliding_metadata_refresh() {
        let meta = EntryMetadata::new(10, 0, ExpirationPolicy::sliding(Duration::from_millis(100)));
        assert_eq!(meta.expires_at_ms(), 100);

        meta.touch(80);
        assert_eq!(meta.expires_at_ms(), 180);
        assert!(!meta.is_expired(150));
        assert_eq!(meta.access_count(), 1);
    }

    #[test]
    fn test_eviction_score_prefers_idle_entries() {
        let busy = EntryMetadata::new(10, 0, ExpirationPolicy::default());
        let idle = EntryMetadata::new(10, 0, ExpirationPolicy::default());
        for _ in 0..10 {
            busy.touch(900);
        }
        assert!(idle.eviction_score(1_000) > busy.eviction_score(1_000));
    }

    #[test]
    fn test_entry_clones_share_metadata() {
        let entry = CacheEntry::new(
            "user:1",
            Bytes::from_static(b"data"),
            TierOrigin::Local,
            ExpirationPolicy::sliding(Duration::from_secs(1)),
            0,
        );
        let clone = entry.clone();
        clone.metadata().touch(500);

        assert_eq!(entry.metadata().access_count(), 1);
        assert_eq!(entry.metadata().expires_at_ms(), 1_500);
        assert_eq!(entry.size(), 4);
        assert_eq!(entry.origin().to_string(), "local");
        assert!(format!("{:?}", entry).contains("CacheEntry"));
    }
}
