//! Redis shared backend
//!
//! Values are stored as plain strings with `SET EX`. Sliding windows live in a
//! side key (`<key>::sliding`) holding the window in seconds; a read that finds
//! one refreshes both keys with `EXPIRE`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;

use super::{SharedBackend, COUNTER_TTL};
use crate::cache::entry::{ExpirationPolicy, MAX_EXPIRATION};
use crate::error::{Error, Result};

/// Suffix of the side key recording a sliding window
pub const SLIDING_SUFFIX: &str = "::sliding";

/// Keys requested per SCAN round trip
const SCAN_BATCH: usize = 500;

#[inline]
fn sliding_key(key: &str) -> String {
    format!("{}{}", key, SLIDING_SUFFIX)
}

/// Redis expirations have one-second resolution; never send 0
#[inline]
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.min(MAX_EXPIRATION).as_secs().max(1)
}

/// Translate a `*`/`?` glob into a Redis MATCH pattern. Redis also treats
/// `[`, `]` and `\` as special, so those are escaped to match literally.
fn redis_glob(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `TTL` answers -1 for a key that exists without an expiration
#[inline]
fn counter_needs_ttl(ttl: i64) -> bool {
    ttl == -1
}

/// Redis-backed shared tier
#[derive(Clone)]
pub struct RedisSharedBackend {
    pool: Pool,
}

impl RedisSharedBackend {
    /// Wrap an existing pool
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a connection pool for `url`.
    ///
    /// No connection is opened here; use `ping` to check reachability.
    pub fn connect(url: &str, pool_size: usize, timeout: Duration) -> Result<Self> {
        let mut config = Config::from_url(url);
        let mut pool_config = PoolConfig::new(pool_size.max(1));
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Config(format!("redis pool for {}: {}", url, e)))?;

        tracing::info!(url = %url, pool_size, "Created Redis connection pool");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// True if a connection can be checked out and answers PING
    pub async fn is_available(&self) -> bool {
        self.ping().await.is_ok()
    }

    fn queue_set(pipe: &mut redis::Pipeline, key: &str, value: &str, policy: ExpirationPolicy) {
        let secs = ttl_secs(policy.duration);
        pipe.set_ex(key, value, secs).ignore();
        if policy.is_sliding() {
            pipe.set_ex(sliding_key(key), secs, secs).ignore();
        } else {
            pipe.del(sliding_key(key)).ignore();
        }
    }
}

#[async_trait]
impl SharedBackend for RedisSharedBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        let (value, window): (Option<String>, Option<i64>) = redis::pipe()
            .get(key)
            .get(sliding_key(key))
            .query_async(&mut conn)
            .await?;

        if let (Some(_), Some(secs)) = (&value, window) {
            let _: () = redis::pipe()
                .expire(key, secs)
                .ignore()
                .expire(sliding_key(key), secs)
                .ignore()
                .query_async(&mut conn)
                .await?;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, policy: ExpirationPolicy) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self::queue_set(&mut pipe, key, &value, policy);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let (removed,): (u64,) = redis::pipe()
            .del(key)
            .del(sliding_key(key))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let secs = ttl_secs(ttl) as i64;
        let (applied,): (bool,) = redis::pipe()
            .expire(key, secs)
            .expire(sliding_key(key), secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }

    /// Native `INCRBY`. A counter without an expiration gets `COUNTER_TTL`;
    /// failing to set it is logged and does not undo the increment.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let (value, ttl): (i64, i64) = redis::pipe()
            .incr(key, delta)
            .ttl(key)
            .query_async(&mut conn)
            .await?;

        if counter_needs_ttl(ttl) {
            let applied: redis::RedisResult<bool> = conn.expire(key, COUNTER_TTL.as_secs() as i64).await;
            if let Err(e) = applied {
                tracing::warn!(key = %key, error = %e, "Failed to set counter expiration");
            }
        }
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.pool.get().await?;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    async fn set_many(&self, items: &[(String, String)], policy: ExpirationPolicy) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in items {
            Self::queue_set(&mut pipe, key, value, policy);
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let side_keys: Vec<String> = keys.iter().map(|k| sliding_key(k)).collect();
        let (removed,): (u64,) = redis::pipe()
            .del(keys)
            .del(side_keys)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(redis_glob(pattern))
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch.into_iter().filter(|k| !k.ends_with(SLIDING_SUFFIX)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(Some(keys))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_side_key() {
        assert_eq!(sliding_key("user:1"), "user:1::sliding");
    }

    #[test]
    fn test_ttl_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(300)), 300);
        assert_eq!(ttl_secs(Duration::MAX), MAX_EXPIRATION.as_secs());
    }

    #[test]
    fn test_glob_escapes_redis_brackets() {
        assert_eq!(redis_glob("report[2024]:*"), "report\\[2024\\]:*");
        assert_eq!(redis_glob("a\\b?"), "a\\\\b?");
        assert_eq!(redis_glob("user:*:profile"), "user:*:profile");
    }

    #[test]
    fn test_only_persistent_counters_get_ttl() {
        assert!(counter_needs_ttl(-1));
        // Already expiring, including a counter created before this call
        assert!(!counter_needs_ttl(86_400));
        assert!(!counter_needs_ttl(0));
        // Key vanished between INCRBY and TTL
        assert!(!counter_needs_ttl(-2));
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RedisSharedBackend::connect("definitely not a url", 4, Duration::from_secs(1));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server on localhost:6379"]
    async fn test_against_live_redis() {
        let backend =
            RedisSharedBackend::connect("redis://127.0.0.1:6379", 4, Duration::from_secs(1)).unwrap();
        assert!(backend.is_available().await);

        let policy = ExpirationPolicy::sliding(Duration::from_secs(30));
        backend.set("tiercache:test:k", "\"v\"".into(), policy).await.unwrap();
        assert_eq!(backend.get("tiercache:test:k").await.unwrap().as_deref(), Some("\"v\""));

        let keys = backend.scan_keys("tiercache:test:*").await.unwrap().unwrap();
        assert_eq!(keys, vec!["tiercache:test:k".to_string()]);

        assert!(backend.remove("tiercache:test:k").await.unwrap());
        assert!(!backend.exists("tiercache:test:k").await.unwrap());

        backend.remove("tiercache:test:[x]").await.unwrap();
        backend.remove("tiercache:test:x").await.unwrap();
        let plain = ExpirationPolicy::absolute(Duration::from_secs(30));
        backend.set("tiercache:test:[x]", "1".into(), plain).await.unwrap();
        backend.set("tiercache:test:x", "1".into(), plain).await.unwrap();
        let keys = backend.scan_keys("tiercache:test:[x]").await.unwrap().unwrap();
        assert_eq!(keys, vec!["tiercache:test:[x]".to_string()]);
        backend.remove("tiercache:test:[x]").await.unwrap();
        backend.remove("tiercache:test:x").await.unwrap();

        backend.remove("tiercache:test:n").await.unwrap();
        assert_eq!(backend.increment("tiercache:test:n", 0).await.unwrap(), 0);
        assert_eq!(backend.increment("tiercache:test:n", 5).await.unwrap(), 5);
        let mut conn = backend.pool().get().await.unwrap();
        let ttl: i64 = conn.ttl("tiercache:test:n").await.unwrap();
        assert!(ttl > 0 && ttl <= COUNTER_TTL.as_secs() as i64);
        backend.remove("tiercache:test:n").await.unwrap();
    }
}
