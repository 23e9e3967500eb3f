//! Operation counters and stats snapshots.
//!
//! Counters are process-local: they reset on restart and on `clear()`. They
//! exist so the admin dashboard can distinguish degraded operation from
//! errors, not for durable metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which backend served the operations behind a stats snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Remote,
    Local,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Remote => "remote",
            Backend::Local => "local",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time stats snapshot for one backend.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
    /// Number of entries currently stored (best effort for the remote store).
    pub size: usize,
    /// Backend that produced these counters.
    pub backend: Backend,
    /// Whether the remote store is currently considered reachable.
    pub healthy: bool,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Shared atomic counters, one set per backend.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

impl StatCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sets(&self, count: u64) {
        self.sets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, size: usize, backend: Backend, healthy: bool) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            size,
            backend,
            healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_calculation() {
        let counters = StatCounters::default();
        for _ in 0..75 {
            counters.record_hit();
        }
        for _ in 0..25 {
            counters.record_miss();
        }

        let stats = counters.snapshot(10, Backend::Local, true);
        assert!((stats.hit_rate() - 75.0).abs() < 0.001);
    }

    #[test]
    fn hit_rate_is_zero_without_gets() {
        let stats = StatCounters::default().snapshot(0, Backend::Remote, true);
        assert!((stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn reset_zeroes_all_counters() {
        let counters = StatCounters::default();
        counters.record_hit();
        counters.record_miss();
        counters.record_sets(3);
        counters.record_error();
        counters.reset();

        let stats = counters.snapshot(0, Backend::Local, false);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.sets, 0);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn backend_display() {
        assert_eq!(Backend::Remote.to_string(), "remote");
        assert_eq!(Backend::Local.as_str(), "local");
    }
}
