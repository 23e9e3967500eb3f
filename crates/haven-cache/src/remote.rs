//! Client for the remote key-value store (Redis).
//!
//! Every data-path call can fail with [`CacheError::RemoteUnavailable`]; that
//! error is the manager's failover trigger and is never silently swallowed
//! here. Expiry is delegated to Redis' native per-key TTL, set at write time
//! and never re-checked client-side.

use std::time::Duration;

use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::{CacheError, CacheResult};
use crate::stats::{Backend, CacheStats, StatCounters};

/// Serialized form stored in the remote KV.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RemoteRecord {
    pub payload: Value,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
}

/// Diagnostic record for a single key. Not used on the hot path.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub exists: bool,
    /// Remaining TTL, `None` for absent keys and keys without expiry.
    pub ttl_remaining: Option<Duration>,
}

fn unix_millis_now() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Redis-backed cache client over a connection pool.
///
/// Pool construction never touches the network; connectivity is probed by
/// [`RemoteCache::ping`] and by the manager's health-check loop.
#[derive(Debug)]
pub struct RemoteCache {
    pool: Pool,
    counters: StatCounters,
}

impl RemoteCache {
    /// Build a remote cache from configuration.
    ///
    /// Returns `None` when the remote store is disabled or the pool cannot
    /// be constructed (e.g. malformed URL); the caller decides whether
    /// running without a remote backend is acceptable.
    pub fn connect(config: &RemoteConfig) -> Option<Self> {
        if !config.enabled {
            info!("remote cache disabled by configuration");
            return None;
        }

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        match redis_config.create_pool(Some(Runtime::Tokio1)) {
            Ok(pool) => {
                info!(url = %config.url, pool_size = config.pool_size, "remote cache pool created");
                Some(Self {
                    pool,
                    counters: StatCounters::default(),
                })
            }
            Err(e) => {
                warn!(error = %e, url = %config.url, "failed to create remote cache pool");
                None
            }
        }
    }

    async fn conn(&self) -> CacheResult<Connection> {
        self.pool.get().await.map_err(|e| {
            self.counters.record_error();
            CacheError::from(e)
        })
    }

    fn transport_err(&self, err: redis::RedisError) -> CacheError {
        self.counters.record_error();
        CacheError::from(err)
    }

    /// Store a value with the store's native TTL.
    pub async fn set(&self, key: &str, payload: Value, ttl: Duration) -> CacheResult<()> {
        let record = RemoteRecord {
            payload,
            created_at: unix_millis_now(),
        };
        let body = serde_json::to_string(&record)?;
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(key, body, ttl_ms)
            .await
            .map_err(|e| self.transport_err(e))?;

        self.counters.record_set();
        debug!(key = %key, ttl_ms, "remote cache set");
        Ok(())
    }

    /// Get a value. `Ok(None)` is a miss, never an error.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let mut conn = self.conn().await?;
        let body: Option<String> = conn.get(key).await.map_err(|e| self.transport_err(e))?;

        match body {
            Some(body) => {
                let record: RemoteRecord = serde_json::from_str(&body)?;
                self.counters.record_hit();
                debug!(key = %key, "remote cache hit");
                Ok(Some(record.payload))
            }
            None => {
                self.counters.record_miss();
                debug!(key = %key, "remote cache miss");
                Ok(None)
            }
        }
    }

    /// Remove a key. Returns true if one was removed.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(|e| self.transport_err(e))?;
        Ok(removed > 0)
    }

    /// Drop every key in the database and reset the counters.
    pub async fn clear(&self) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.transport_err(e))?;
        self.counters.reset();
        info!("remote cache cleared");
        Ok(())
    }

    /// Liveness probe. Returns false on any failure; callers must not
    /// distinguish "unhealthy" from "network error" at this layer.
    pub async fn ping(&self) -> bool {
        match self.pool.get().await {
            Ok(mut conn) => {
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
            Err(_) => false,
        }
    }

    /// Read a plain string key outside the record envelope. Used for
    /// namespace version counters, which live in their own key space.
    pub async fn get_raw(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await.map_err(|e| self.transport_err(e))?;
        Ok(value)
    }

    /// Atomically bump a counter key and return the new value.
    ///
    /// A key that has never been written counts as 1, so the first bump
    /// yields 2. The counter carries no TTL.
    pub async fn bump_version(&self, key: &str) -> CacheResult<i64> {
        self.bump_version_by(key, 1).await
    }

    /// Bump a counter key by an arbitrary delta. Used to replay several
    /// bumps that accumulated while the store was unreachable in one round
    /// trip.
    pub async fn bump_version_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut conn = self.conn().await?;
        let (_, version): (Option<String>, i64) = redis::pipe()
            .cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.transport_err(e))?;
        Ok(version)
    }

    /// Apply a batch of writes in a single pipeline (one round trip,
    /// all-or-nothing at the transport level).
    pub async fn mset(&self, items: Vec<(String, Value, Duration)>) -> CacheResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let created_at = unix_millis_now();
        let count = items.len() as u64;
        let mut pipe = redis::pipe();
        for (key, payload, ttl) in items {
            let body = serde_json::to_string(&RemoteRecord {
                payload,
                created_at,
            })?;
            pipe.cmd("SET")
                .arg(key)
                .arg(body)
                .arg("PX")
                .arg((ttl.as_millis() as u64).max(1))
                .ignore();
        }

        let mut conn = self.conn().await?;
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.transport_err(e))?;

        self.counters.record_sets(count);
        debug!(count, "remote cache pipelined mset");
        Ok(())
    }

    /// Diagnostic lookup for a single key.
    pub async fn key_info(&self, key: &str) -> CacheResult<KeyInfo> {
        let mut conn = self.conn().await?;
        let exists: bool = conn.exists(key).await.map_err(|e| self.transport_err(e))?;
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.transport_err(e))?;

        // PTTL returns -2 for absent keys and -1 for keys without expiry
        let ttl_remaining = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
        Ok(KeyInfo {
            exists,
            ttl_remaining,
        })
    }

    /// List keys matching a glob pattern via cursor-based SCAN.
    ///
    /// Admin/diagnostic use only: O(n) against the remote store, never call
    /// this on a hot path.
    pub async fn list_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| self.transport_err(e))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    /// Stats snapshot. Size comes from DBSIZE and is best effort: 0 when
    /// the store is unreachable, without touching the error counter.
    pub async fn stats(&self) -> CacheStats {
        let size = self.dbsize().await.unwrap_or(0);
        self.counters.snapshot(size, Backend::Remote, true)
    }

    async fn dbsize(&self) -> Option<usize> {
        let mut conn = self.pool.get().await.ok()?;
        let size: i64 = redis::cmd("DBSIZE").query_async(&mut conn).await.ok()?;
        Some(size.max(0) as usize)
    }
}
