//! Cache gate — Redis-backed ephemeral throttle markers and counters.
//!
//! The durable store is authoritative for per-user notification windows; the
//! cache gate covers high-frequency keys where losing state on a Redis
//! restart is acceptable. Key expiry is the window boundary, so there is no
//! cleanup to run.
//!
//! Uses Redis `SET NX EX` for atomic check-and-set with automatic TTL expiry.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use klaxon_common::error::AppError;

/// Redis-backed throttle gate with namespaced keys.
#[derive(Clone)]
pub struct CacheGate {
    redis: ConnectionManager,
    prefix: String,
}

impl CacheGate {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    /// Namespaced key for a derived throttle identity.
    pub fn throttle_key(&self, derived: &str) -> String {
        format!("{}:throttle:{}", self.prefix, derived)
    }

    fn counter_key(&self, name: &str) -> String {
        format!("{}:counter:{}", self.prefix, name)
    }

    /// Atomically claim `key` for `ttl_secs` seconds.
    ///
    /// Returns `true` if the key was absent and is now set (the caller owns
    /// the window), `false` if it already existed (window still open).
    ///
    /// `ttl_secs` must be positive; Redis rejects `EX 0`. Zero windows are
    /// decided upstream without touching the cache.
    ///
    /// Uses Redis `SET key value NX EX ttl` for atomic check-and-set:
    /// - NX = only set if key doesn't exist
    /// - EX = set TTL in seconds
    pub async fn set_if_absent(&self, key: &str, ttl_secs: i64) -> Result<bool, AppError> {
        let mut redis = self.redis.clone();

        // SET key "1" NX EX ttl_secs
        // Returns Some("OK") if key was set (window claimed)
        // Returns None if key already exists (window open)
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut redis)
            .await?;

        Ok(result.is_some())
    }

    /// Drop a throttle marker (admin reset and tests).
    pub async fn clear(&self, key: &str) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Increment a TTL'd counter, creating it with the given expiry.
    ///
    /// The expiry is only set on creation, so the counter measures events per
    /// fixed window starting at the first increment.
    pub async fn increment(&self, name: &str, ttl_secs: i64) -> Result<i64, AppError> {
        let key = self.counter_key(name);
        let mut redis = self.redis.clone();

        let count: i64 = redis.incr(&key, 1).await?;
        if count == 1 {
            redis.expire::<_, ()>(&key, ttl_secs).await?;
        }

        Ok(count)
    }
}
