//! Invalidation Index
//!
//! Tag → keys index with reverse membership, plus an explicit registry of
//! every key written through the cache so glob/prefix invalidation does not
//! depend on the shared backend being able to enumerate keys.
//!
//! Registered keys carry the deadline of their shared entry; `purge_expired`
//! drops keys whose entry has lapsed so the index does not outlive the data.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use tokio::time::Instant;

use super::entry::{expires_after, ExpirationPolicy};
use crate::error::{Error, Result};

// =============================================================================
// Glob Patterns
// =============================================================================

/// Compiled key pattern: `*` matches any run of characters, `?` exactly one
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    prefix: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".into(),
            });
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let prefix = pattern
            .split(['*', '?'])
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            source: pattern.to_string(),
            prefix,
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Characters every match must start with
    pub fn literal_prefix(&self) -> &str {
        &self.prefix
    }

    /// True if the pattern has no wildcards
    pub fn is_literal(&self) -> bool {
        self.prefix.len() == self.source.len()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

// =============================================================================
// Invalidation Index
// =============================================================================

/// How long a registered key's shared entry is expected to live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Lease {
    /// `None` never lapses
    deadline: Option<Instant>,
    /// Sliding window, re-applied each time the key is seen in the shared tier
    window: Option<Duration>,
}

impl Lease {
    fn for_policy(policy: ExpirationPolicy, now: Instant) -> Self {
        Self {
            deadline: Some(expires_after(now, policy.duration)),
            window: policy.is_sliding().then_some(policy.duration),
        }
    }

    fn is_lapsed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Default)]
struct IndexState {
    /// tag -> keys
    tags: HashMap<String, HashSet<String>>,
    /// key -> tags, so removing a key touches only its own tags
    memberships: HashMap<String, HashSet<String>>,
    /// Every key written through the cache, ordered for prefix scans
    registry: BTreeMap<String, Lease>,
}

impl IndexState {
    /// Make `tags` the key's complete tag set
    fn attach<I, S>(&mut self, key: &str, tags: I, lease: Lease)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.detach(key);
        self.registry.insert(key.to_string(), lease);

        for tag in tags {
            let tag = tag.as_ref();
            self.tags
                .entry(tag.to_string())
                .or_default()
                .insert(key.to_string());
            self.memberships
                .entry(key.to_string())
                .or_default()
                .insert(tag.to_string());
        }
    }

    fn detach(&mut self, key: &str) -> bool {
        let Some(tags) = self.memberships.remove(key) else {
            return false;
        };
        for tag in tags {
            if let Some(keys) = self.tags.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(&tag);
                }
            }
        }
        true
    }
}

/// Index sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCounts {
    pub tags: usize,
    pub tagged_keys: usize,
    pub registered_keys: usize,
}

/// Tag and key registry.
///
/// All three maps sit behind one lock so a key is never visible in a tag set
/// without its reverse membership, and vice versa.
#[derive(Debug, Default)]
pub struct InvalidationIndex {
    state: RwLock<IndexState>,
}

impl InvalidationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` with exactly `tags`, replacing any earlier tag set. The
    /// registration never lapses. Idempotent.
    pub fn register<I, S>(&self, key: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.state.write().attach(key, tags, Lease::default());
    }

    /// Record a key written with `policy`, replacing any earlier tag set. The
    /// registration lapses when the written entry would expire.
    pub fn register_with_policy<I, S>(&self, key: &str, tags: I, policy: ExpirationPolicy)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lease = Lease::for_policy(policy, Instant::now());
        self.state.write().attach(key, tags, lease);
    }

    /// Record that `key` was just seen live in the shared tier with at least
    /// `ttl` left. Tags are untouched; a known sliding window is renewed.
    pub fn register_key(&self, key: &str, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.state.write();
        match state.registry.get_mut(key) {
            Some(lease) => {
                let renewed = expires_after(now, lease.window.unwrap_or(ttl));
                lease.deadline = lease.deadline.map(|deadline| deadline.max(renewed));
            }
            None => {
                let lease = Lease {
                    deadline: Some(expires_after(now, ttl)),
                    window: None,
                };
                state.registry.insert(key.to_string(), lease);
            }
        }
    }

    /// Drop keys whose shared entry has lapsed, with their tag memberships
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut state = self.state.write();
        let lapsed: Vec<String> = state
            .registry
            .iter()
            .filter(|(_, lease)| lease.is_lapsed(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &lapsed {
            state.detach(key);
            state.registry.remove(key);
        }
        lapsed.len()
    }

    /// Remove `key` from every tag set and from the registry. Tags left empty
    /// are dropped.
    pub fn unregister(&self, key: &str) {
        let mut state = self.state.write();
        state.detach(key);
        state.registry.remove(key);
    }

    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        self.state
            .read()
            .tags
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove a tag and return its keys; each key is also detached from its
    /// other tags and dropped from the registry
    pub fn take_tag(&self, tag: &str) -> HashSet<String> {
        let mut state = self.state.write();
        let Some(keys) = state.tags.remove(tag) else {
            return HashSet::new();
        };
        for key in &keys {
            state.detach(key);
            state.registry.remove(key);
        }
        keys
    }

    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        self.state
            .read()
            .memberships
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.state.read().registry.contains_key(key)
    }

    /// Registered keys starting with `prefix`, in order
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let state = self.state.read();
        state
            .registry
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Registered keys matching `pattern`, in order
    pub fn keys_matching(&self, pattern: &GlobPattern) -> Vec<String> {
        let prefix = pattern.literal_prefix();
        let state = self.state.read();
        state
            .registry
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> IndexCounts {
        let state = self.state.read();
        IndexCounts {
            tags: state.tags.len(),
            tagged_keys: state.memberships.len(),
            registered_keys: state.registry.len(),
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.tags.clear();
        state.memberships.clear();
        state.registry.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
