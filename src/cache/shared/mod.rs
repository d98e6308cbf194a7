//! Shared Tier - Distributed Cache Adapter
//!
//! Thin adapter over a cross-process cache backend holding the string form of
//! each value.
//!
//! # Design
//!
//! - Pluggable backend (`SharedBackend`): in-process map or Redis
//! - Every call is bounded by a timeout
//! - Backend errors and timeouts are logged and turned into "not found" /
//!   "not applied" results; nothing here returns `Err` to the coordinator

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::entry::ExpirationPolicy;
use crate::error::{Error, Result};

pub mod memory;
pub mod redis;

pub use memory::InMemorySharedBackend;
pub use self::redis::RedisSharedBackend;

/// Lifetime given to counters created by `increment`
pub const COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default per-call timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Shared cache backend
///
/// Implementations report failures through `Err`; the `SharedTier` adapter is
/// what absorbs them.
#[async_trait]
pub trait SharedBackend: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Get the string form stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key` with the given expiration
    async fn set(&self, key: &str, value: String, policy: ExpirationPolicy) -> Result<()>;

    /// Delete `key`, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Check if `key` holds a live value
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Reset the lifetime of an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Add `delta` to the integer stored under `key` (missing counts as 0).
    ///
    /// The default is a read-modify-write and is not atomic across
    /// processes. Backends with native counters should override it.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let current = match self.get(key).await? {
            Some(raw) => raw.trim().parse::<i64>().map_err(|e| {
                Error::Serialization(format!("value under {} is not an integer: {}", key, e))
            })?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::Backend(format!("counter {} would overflow", key)))?;
        self.set(key, next.to_string(), ExpirationPolicy::absolute(COUNTER_TTL))
            .await?;
        Ok(next)
    }

    /// Get several keys; missing keys are absent from the result
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    /// Store several values with one expiration
    async fn set_many(&self, items: &[(String, String)], policy: ExpirationPolicy) -> Result<()> {
        for (key, value) in items {
            self.set(key, value.clone(), policy).await?;
        }
        Ok(())
    }

    /// Delete several keys, returning how many existed
    async fn remove_many(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.remove(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Enumerate keys matching a glob (`*`, `?`).
    ///
    /// Key enumeration is an opt-in capability: backends that cannot scan
    /// return `Ok(None)`.
    async fn scan_keys(&self, _pattern: &str) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Drop expired entries the backend still holds, returning how many.
    ///
    /// Backends that expire keys on their own keep the default.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    /// Check connectivity
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Shared Tier Adapter
// =============================================================================

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

/// Shared tier statistics
#[derive(Debug, Clone, Default)]
pub struct SharedTierStats {
    pub backend: &'static str,
    pub calls: u64,
    pub failures: u64,
    pub timeouts: u64,
}

/// Fault-absorbing, timeout-bounded view of a `SharedBackend`.
///
/// Cloning is cheap; clones share the backend and the counters.
#[derive(Clone)]
pub struct SharedTier {
    backend: Arc<dyn SharedBackend>,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl SharedTier {
    /// Wrap a backend with the default call timeout
    pub fn new(backend: Arc<dyn SharedBackend>) -> Self {
        Self::with_backend_timeout(backend, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_backend_timeout(backend: Arc<dyn SharedBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Same backend and counters, different per-call timeout
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            timeout,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backend(&self) -> &Arc<dyn SharedBackend> {
        &self.backend
    }

    /// Run a backend call under the timeout, absorbing any failure
    async fn call<T, F>(&self, operation: &'static str, target: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    backend = self.backend.name(),
                    operation,
                    key = %target,
                    error = %e,
                    "Shared tier call failed"
                );
                None
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let e = Error::BackendTimeout {
                    operation,
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                tracing::warn!(
                    backend = self.backend.name(),
                    operation,
                    key = %target,
                    error = %e,
                    "Shared tier call timed out"
                );
                None
            }
        }
    }

    /// Get the string form of `key`
    pub async fn get_string(&self, key: &str) -> Option<String> {
        self.call("get", key, self.backend.get(key)).await.flatten()
    }

    /// Store the string form of `key`. Returns false if the write was not applied.
    pub async fn set_string(&self, key: &str, value: String, policy: ExpirationPolicy) -> bool {
        self.call("set", key, self.backend.set(key, value, policy))
            .await
            .is_some()
    }

    pub async fn remove(&self, key: &str) -> bool {
        self.call("remove", key, self.backend.remove(key))
            .await
            .unwrap_or(false)
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.call("exists", key, self.backend.exists(key))
            .await
            .unwrap_or(false)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.call("expire", key, self.backend.expire(key, ttl))
            .await
            .unwrap_or(false)
    }

    /// Add `delta` to a counter; `None` means the update was not applied
    pub async fn increment(&self, key: &str, delta: i64) -> Option<i64> {
        self.call("increment", key, self.backend.increment(key, delta))
            .await
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Option<i64> {
        self.increment(key, delta.saturating_neg()).await
    }

    pub async fn get_many(&self, keys: &[String]) -> HashMap<String, String> {
        if keys.is_empty() {
            return HashMap::new();
        }
        let target = format!("{} keys", keys.len());
        self.call("get_many", &target, self.backend.get_many(keys))
            .await
            .unwrap_or_default()
    }

    pub async fn set_many(&self, items: &[(String, String)], policy: ExpirationPolicy) -> bool {
        if items.is_empty() {
            return true;
        }
        let target = format!("{} keys", items.len());
        self.call("set_many", &target, self.backend.set_many(items, policy))
            .await
            .is_some()
    }

    pub async fn remove_many(&self, keys: &[String]) -> u64 {
        if keys.is_empty() {
            return 0;
        }
        let target = format!("{} keys", keys.len());
        self.call("remove_many", &target, self.backend.remove_many(keys))
            .await
            .unwrap_or(0)
    }

    /// Keys matching `pattern`, or `None` when the backend cannot enumerate
    /// keys or the scan failed
    pub async fn scan_keys(&self, pattern: &str) -> Option<Vec<String>> {
        self.call("scan_keys", pattern, self.backend.scan_keys(pattern))
            .await
            .flatten()
    }

    /// Sweep expired entries out of the backend; 0 when it expires keys itself
    pub async fn purge_expired(&self) -> u64 {
        self.call("purge_expired", "*", self.backend.purge_expired())
            .await
            .unwrap_or(0)
    }

    pub async fn ping(&self) -> bool {
        self.call("ping", "-", self.backend.ping()).await.is_some()
    }

    pub fn stats(&self) -> SharedTierStats {
        SharedTierStats {
            backend: self.backend.name(),
            calls: self.counters.calls.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SharedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTier")
            .field("backend", &self.backend.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
