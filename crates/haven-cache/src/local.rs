//! In-process fallback cache with TTL expiry.
//!
//! Zero external dependencies at runtime: this is the backend the manager
//! serves from while the remote store is unreachable. Entries expire lazily
//! on read, plus a periodic background sweep bounds memory growth from
//! write-once/never-read keys.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use crate::stats::{Backend, CacheStats, StatCounters};

/// A cached entry with TTL support.
///
/// The payload is wrapped in `Arc` to allow cheap cloning on cache hits.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub payload: Arc<Value>,
    pub expires_at: Instant,
    pub created_at: OffsetDateTime,
}

impl CacheEntry {
    fn new(payload: Value, ttl: Duration) -> Self {
        Self {
            payload: Arc::new(payload),
            expires_at: Instant::now() + ttl,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// A zero TTL means the entry expires on the next read.
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process TTL-keyed store used while the remote store is unreachable.
///
/// All operations are infallible; a miss is a normal return value.
#[derive(Debug)]
pub struct LocalFallbackCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    counters: StatCounters,
    sweep_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl LocalFallbackCache {
    /// Create a new local cache. The background sweep is not started until
    /// [`LocalFallbackCache::start_sweeper`] is called.
    pub fn new(sweep_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            entries: Arc::new(DashMap::new()),
            counters: StatCounters::default(),
            sweep_interval,
            shutdown,
        }
    }

    /// Store a value. A zero `ttl` makes the entry expire on the next read.
    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        self.counters.record_set();
    }

    /// Get a value. Expired entries are evicted on this lazy check and count
    /// as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.counters.record_hit();
                return Some(Arc::clone(&entry.payload));
            }
            // Entry expired, remove it
            let age_ms = (OffsetDateTime::now_utc() - entry.created_at).whole_milliseconds();
            debug!(key = %key, age_ms = age_ms as i64, "evicting expired entry on read");
            drop(entry);
            self.entries.remove(key);
        }

        self.counters.record_miss();
        None
    }

    /// Remove an entry. Returns true if one was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop all entries and reset the counters.
    pub fn clear(&self) {
        self.entries.clear();
        self.counters.reset();
    }

    /// Evict every expired entry, independent of reads. Returns the number
    /// of entries removed.
    pub fn sweep(&self) -> usize {
        Self::sweep_map(&self.entries)
    }

    fn sweep_map(entries: &DashMap<String, CacheEntry>) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    /// Start the periodic sweep task. The task stops when [`destroy`] is
    /// called or the cache is dropped.
    ///
    /// [`destroy`]: LocalFallbackCache::destroy
    pub fn start_sweeper(&self) {
        let entries = Arc::clone(&self.entries);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = Self::sweep_map(&entries);
                        if removed > 0 {
                            debug!(removed, "local cache sweep evicted expired entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("local cache sweeper stopped");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Number of entries currently stored, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stats snapshot for this backend.
    pub fn stats(&self) -> CacheStats {
        self.counters
            .snapshot(self.entries.len(), Backend::Local, false)
    }

    /// Stop the sweep task and drop all state. Safe to call multiple times.
    pub fn destroy(&self) {
        let _ = self.shutdown.send(true);
        self.entries.clear();
        self.counters.reset();
        info!("local fallback cache destroyed");
    }
}
