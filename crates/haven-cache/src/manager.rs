//! Cache manager: the single surface collaborators talk to.
//!
//! Owns a health flag, forwards operations to the remote store while it is
//! reachable and falls back to the in-process cache when it is not, and
//! implements namespace-scoped keys with version-based bulk invalidation.
//!
//! ## Degraded mode
//!
//! A failed remote call flips the manager to degraded immediately and the
//! same logical operation is retried against the local fallback before
//! returning, so a data-path call never fails merely because the remote
//! store is down. A background loop re-probes the store; on the first
//! successful ping it replays the version bumps performed while degraded
//! against the remote counters, then flips back to healthy. Entries written
//! while degraded are not backfilled: they stay local-only and become
//! invisible once reads go to the remote store again. Callers that need
//! cross-instance consistency must not rely on cache reads after a failover
//! window.
//!
//! ## Namespace invalidation
//!
//! Every physical key embeds its namespace's version counter. Bumping the
//! counter makes all keys composed under the old version unreachable in one
//! O(1) operation; the stale entries are reclaimed by TTL expiry. The
//! counters themselves live in a separate, unversioned key space
//! (`{prefix}:{ns}:__version__`) so version reads cannot recurse.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::local::LocalFallbackCache;
use crate::remote::{KeyInfo, RemoteCache};
use crate::stats::{Backend, CacheStats, StatCounters};

/// Namespace used when callers do not care about grouping.
pub const DEFAULT_NAMESPACE: &str = "general";

/// Version assumed for a namespace whose counter has never been written.
const DEFAULT_VERSION: i64 = 1;

const VERSION_FIELD: &str = "__version__";

/// Counters live in an unversioned key space so version reads cannot recurse.
fn version_key(prefix: &str, namespace: &str) -> String {
    format!("{prefix}:{namespace}:{VERSION_FIELD}")
}

/// One write in a bulk [`CacheManager::mset`] batch.
#[derive(Debug, Clone)]
pub struct MsetItem {
    pub key: String,
    pub value: Value,
    /// `None` applies the manager's default TTL.
    pub ttl: Option<Duration>,
    pub namespace: String,
}

impl MsetItem {
    /// Build an item from any serializable value, in the default namespace.
    /// Serialization errors surface here, before the batch is applied, so a
    /// bad value never poisons the rest of a batch.
    pub fn new<T: Serialize>(key: impl Into<String>, value: &T) -> CacheResult<Self> {
        Ok(Self {
            key: key.into(),
            value: serde_json::to_value(value)?,
            ttl: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

/// Per-batch outcome of [`CacheManager::mset`]: counts, not a single bool.
/// Serialization errors are rejected up front by [`MsetItem::new`] and each
/// backend applies a batch as a whole, so with the current backends `failed`
/// is always zero; the count exists for callers that aggregate outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsetOutcome {
    pub applied: usize,
    pub failed: usize,
}

/// Resilient cache front-end over an optional remote store and an optional
/// in-process fallback. At least one backend must be configured.
#[derive(Debug)]
pub struct CacheManager {
    remote: Option<Arc<RemoteCache>>,
    local: Option<LocalFallbackCache>,
    /// Local mirror of namespace version counters; authoritative while the
    /// remote store is unreachable.
    versions: Arc<DashMap<String, i64>>,
    /// Version bumps performed while degraded, keyed by namespace. Replayed
    /// against the remote counters by the health loop before it flips back
    /// to healthy, so invalidations survive the failover window.
    pending_bumps: Arc<DashMap<String, i64>>,
    healthy: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    key_prefix: String,
    default_ttl: Duration,
}

impl CacheManager {
    /// Build the manager, probe the remote store once to seed the health
    /// flag, and start the background tasks (health-check loop, local
    /// sweeper).
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        let remote = RemoteCache::connect(&config.remote).map(Arc::new);
        let local = config
            .local_fallback
            .then(|| LocalFallbackCache::new(Duration::from_millis(config.sweep_interval_ms)));

        if remote.is_none() && local.is_none() {
            return Err(CacheError::configuration(
                "no cache backend configured: remote disabled and local fallback off",
            ));
        }

        let healthy = Arc::new(AtomicBool::new(false));
        if let Some(remote) = &remote {
            let up = remote.ping().await;
            healthy.store(up, Ordering::Relaxed);
            if up {
                info!("remote cache reachable, starting healthy");
            } else {
                warn!("remote cache unreachable at startup, starting degraded");
            }
        }

        if let Some(local) = &local {
            local.start_sweeper();
        }

        let versions = Arc::new(DashMap::new());
        let pending_bumps = Arc::new(DashMap::new());

        let (shutdown, shutdown_rx) = watch::channel(false);
        if let Some(remote) = &remote {
            HealthLoop {
                remote: Arc::clone(remote),
                healthy: Arc::clone(&healthy),
                versions: Arc::clone(&versions),
                pending_bumps: Arc::clone(&pending_bumps),
                key_prefix: config.key_prefix.clone(),
                period: Duration::from_millis(config.health_check_interval_ms),
            }
            .start(shutdown_rx);
        }

        Ok(Self {
            remote,
            local,
            versions,
            pending_bumps,
            healthy,
            closed: AtomicBool::new(false),
            shutdown,
            key_prefix: config.key_prefix,
            default_ttl: Duration::from_millis(config.default_ttl_ms),
        })
    }

    /// Whether the remote store is currently considered reachable.
    pub fn is_healthy(&self) -> bool {
        self.remote.is_some() && self.healthy.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// Remote is attempted while healthy, and also while degraded when no
    /// local fallback exists (the error then surfaces to the caller).
    fn use_remote(&self) -> bool {
        self.remote.is_some() && (self.is_healthy() || self.local.is_none())
    }

    fn mark_degraded(&self) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!("remote cache operation failed, entering degraded mode");
        }
    }

    fn version_key(&self, namespace: &str) -> String {
        version_key(&self.key_prefix, namespace)
    }

    fn physical_key(&self, namespace: &str, version: i64, key: &str) -> String {
        format!("{}:{}:v{}:{}", self.key_prefix, namespace, version, key)
    }

    /// Missing and zero TTLs both mean the configured default.
    fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.default_ttl,
        }
    }

    /// Resolve a namespace's current version. Read through the remote store
    /// while healthy (absent counter means version 1), from the local mirror
    /// otherwise.
    async fn current_version(&self, namespace: &str) -> i64 {
        if self.use_remote() {
            if let Some(remote) = &self.remote {
                match remote.get_raw(&self.version_key(namespace)).await {
                    Ok(Some(raw)) => {
                        let version = raw.parse().unwrap_or(DEFAULT_VERSION);
                        self.versions.insert(namespace.to_string(), version);
                        return version;
                    }
                    Ok(None) => return DEFAULT_VERSION,
                    Err(e) => {
                        debug!(namespace, error = %e, "version read failed, using local mirror");
                        self.mark_degraded();
                    }
                }
            }
        }

        self.versions
            .get(namespace)
            .map(|v| *v)
            .unwrap_or(DEFAULT_VERSION)
    }

    /// Get a value. `Ok(None)` is a miss; a remote failure degrades the
    /// manager and retries against the local fallback instead of erroring.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        namespace: &str,
    ) -> CacheResult<Option<T>> {
        self.ensure_open()?;
        let version = self.current_version(namespace).await;
        let physical = self.physical_key(namespace, version, key);

        if self.use_remote() {
            if let Some(remote) = &self.remote {
                match remote.get(&physical).await {
                    Ok(Some(payload)) => return Ok(Some(serde_json::from_value(payload)?)),
                    Ok(None) => return Ok(None),
                    Err(e) if e.is_remote_unavailable() => {
                        self.mark_degraded();
                        if self.local.is_none() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match &self.local {
            Some(local) => match local.get(&physical) {
                Some(payload) => Ok(Some(serde_json::from_value((*payload).clone())?)),
                None => Ok(None),
            },
            None => Err(CacheError::remote_unavailable(
                "remote store down and no local fallback configured",
            )),
        }
    }

    /// Store a value under a namespace. A missing or zero TTL applies the
    /// configured default (10 minutes unless overridden).
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        namespace: &str,
    ) -> CacheResult<()> {
        self.ensure_open()?;
        let payload = serde_json::to_value(value)?;
        let ttl = self.effective_ttl(ttl);
        let version = self.current_version(namespace).await;
        let physical = self.physical_key(namespace, version, key);

        if self.use_remote() {
            if let Some(remote) = &self.remote {
                match remote.set(&physical, payload.clone(), ttl).await {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_remote_unavailable() => {
                        self.mark_degraded();
                        if self.local.is_none() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match &self.local {
            Some(local) => {
                local.set(&physical, payload, ttl);
                Ok(())
            }
            None => Err(CacheError::remote_unavailable(
                "remote store down and no local fallback configured",
            )),
        }
    }

    /// Remove a key. Returns true if the active backend had an entry.
    pub async fn delete(&self, key: &str, namespace: &str) -> CacheResult<bool> {
        self.ensure_open()?;
        let version = self.current_version(namespace).await;
        let physical = self.physical_key(namespace, version, key);

        if self.use_remote() {
            if let Some(remote) = &self.remote {
                match remote.delete(&physical).await {
                    Ok(removed) => return Ok(removed),
                    Err(e) if e.is_remote_unavailable() => {
                        self.mark_degraded();
                        if self.local.is_none() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match &self.local {
            Some(local) => Ok(local.delete(&physical)),
            None => Err(CacheError::remote_unavailable(
                "remote store down and no local fallback configured",
            )),
        }
    }

    /// Atomically bump a namespace's version counter and return the new
    /// version. Every key composed under the previous version becomes
    /// unreachable; the stale entries are reclaimed by TTL expiry, so this
    /// is O(1) regardless of how many keys the namespace holds.
    ///
    /// While degraded the bump lands in the local mirror and is recorded as
    /// pending; the health loop replays it against the remote counter before
    /// leaving degraded mode, so the invalidation holds after recovery.
    pub async fn invalidate_namespace(&self, namespace: &str) -> CacheResult<i64> {
        self.ensure_open()?;

        if self.use_remote() {
            if let Some(remote) = &self.remote {
                match remote.bump_version(&self.version_key(namespace)).await {
                    Ok(version) => {
                        self.versions.insert(namespace.to_string(), version);
                        info!(namespace, version, "namespace invalidated");
                        return Ok(version);
                    }
                    Err(e) if e.is_remote_unavailable() => {
                        self.mark_degraded();
                        if self.local.is_none() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if self.local.is_some() {
            let mut entry = self
                .versions
                .entry(namespace.to_string())
                .or_insert(DEFAULT_VERSION);
            *entry += 1;
            let version = *entry;
            drop(entry);
            if self.remote.is_some() {
                *self.pending_bumps.entry(namespace.to_string()).or_insert(0) += 1;
            }
            info!(namespace, version, "namespace invalidated (local)");
            Ok(version)
        } else {
            Err(CacheError::remote_unavailable(
                "remote store down and no local fallback configured",
            ))
        }
    }

    /// Clear cached data.
    ///
    /// Without a namespace this is a full clear of both backends (counters
    /// included) plus the version mirror. With a namespace it bumps that
    /// namespace's version (same effect as [`invalidate_namespace`], no
    /// physical deletion); the old entries age out by TTL.
    ///
    /// [`invalidate_namespace`]: CacheManager::invalidate_namespace
    pub async fn clear(&self, namespace: Option<&str>) -> CacheResult<()> {
        self.ensure_open()?;

        if let Some(namespace) = namespace {
            self.invalidate_namespace(namespace).await?;
            return Ok(());
        }

        if self.use_remote() {
            if let Some(remote) = &self.remote {
                match remote.clear().await {
                    Ok(()) => {}
                    Err(e) if e.is_remote_unavailable() => {
                        self.mark_degraded();
                        if self.local.is_none() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(local) = &self.local {
            local.clear();
        }
        self.versions.clear();
        self.pending_bumps.clear();
        Ok(())
    }

    /// Apply a batch of writes. Pipelined against the remote store while
    /// healthy; the whole batch falls back to the local cache on transport
    /// failure. Returns success/failure counts rather than a single bool.
    pub async fn mset(&self, items: Vec<MsetItem>) -> CacheResult<MsetOutcome> {
        self.ensure_open()?;
        if items.is_empty() {
            return Ok(MsetOutcome::default());
        }

        // Resolve each namespace's version once per batch
        let mut batch_versions: std::collections::HashMap<String, i64> = Default::default();
        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            let version = match batch_versions.get(&item.namespace) {
                Some(v) => *v,
                None => {
                    let version = self.current_version(&item.namespace).await;
                    batch_versions.insert(item.namespace.clone(), version);
                    version
                }
            };
            let physical = self.physical_key(&item.namespace, version, &item.key);
            resolved.push((physical, item.value, self.effective_ttl(item.ttl)));
        }
        let total = resolved.len();

        if self.use_remote() {
            if let Some(remote) = &self.remote {
                match remote.mset(resolved.clone()).await {
                    Ok(()) => {
                        return Ok(MsetOutcome {
                            applied: total,
                            failed: 0,
                        });
                    }
                    Err(e) if e.is_remote_unavailable() => {
                        self.mark_degraded();
                        if self.local.is_none() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match &self.local {
            Some(local) => {
                for (physical, payload, ttl) in resolved {
                    local.set(&physical, payload, ttl);
                }
                Ok(MsetOutcome {
                    applied: total,
                    failed: 0,
                })
            }
            None => Err(CacheError::remote_unavailable(
                "remote store down and no local fallback configured",
            )),
        }
    }

    /// Active backend's counters, tagged with the backend and the current
    /// health flag so dashboards can tell degraded operation from errors.
    ///
    /// Infallible read-only probe: unlike the data-path operations it does
    /// not fail after [`destroy`], it reports an empty, unhealthy snapshot.
    ///
    /// [`destroy`]: CacheManager::destroy
    pub async fn stats(&self) -> CacheStats {
        if self.closed.load(Ordering::Relaxed) {
            let backend = if self.local.is_some() {
                Backend::Local
            } else {
                Backend::Remote
            };
            return StatCounters::default().snapshot(0, backend, false);
        }

        let healthy = self.is_healthy();

        // Degraded with no fallback still reports the remote counters
        if self.use_remote() {
            if let Some(remote) = &self.remote {
                let mut stats = remote.stats().await;
                stats.healthy = healthy;
                return stats;
            }
        }

        match &self.local {
            Some(local) => {
                let mut stats = local.stats();
                stats.healthy = healthy;
                stats
            }
            None => StatCounters::default().snapshot(0, Backend::Remote, healthy),
        }
    }

    /// Probe the remote store directly. Infallible read-only probe: it
    /// reports false when the manager is closed, when no remote store is
    /// configured, or when the probe itself fails, rather than erroring.
    pub async fn ping(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        match &self.remote {
            Some(remote) => remote.ping().await,
            None => false,
        }
    }

    /// Diagnostic lookup for a key under its namespace's current version.
    /// Errors surface directly; there are no fallback semantics here.
    pub async fn key_info(&self, key: &str, namespace: &str) -> CacheResult<KeyInfo> {
        self.ensure_open()?;
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CacheError::remote_unavailable("remote cache not configured"))?;
        let version = self.current_version(namespace).await;
        remote.key_info(&self.physical_key(namespace, version, key)).await
    }

    /// List physical keys matching a glob pattern. Admin/diagnostic only;
    /// O(n) against the remote store. Errors surface directly.
    pub async fn list_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.ensure_open()?;
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CacheError::remote_unavailable("remote cache not configured"))?;
        remote.list_keys(pattern).await
    }

    /// Stop the background tasks and release the backends. Idempotent;
    /// every subsequent data-path operation fails fast with
    /// [`CacheError::Closed`], while the infallible probes ([`stats`],
    /// [`ping`], [`is_healthy`]) keep answering with closed-state values.
    /// The service's shutdown sequence owns this call.
    ///
    /// [`stats`]: CacheManager::stats
    /// [`ping`]: CacheManager::ping
    /// [`is_healthy`]: CacheManager::is_healthy
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        let _ = self.shutdown.send(true);
        self.healthy.store(false, Ordering::Relaxed);
        if let Some(local) = &self.local {
            local.destroy();
        }
        info!("cache manager shut down");
    }
}

/// Background prober for the remote store. Owns the degraded/healthy
/// transitions of the shared health flag; the data path only ever flips it
/// to degraded.
struct HealthLoop {
    remote: Arc<RemoteCache>,
    healthy: Arc<AtomicBool>,
    versions: Arc<DashMap<String, i64>>,
    pending_bumps: Arc<DashMap<String, i64>>,
    key_prefix: String,
    period: Duration,
}

impl HealthLoop {
    fn start(self, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.tick().await; // first tick fires immediately; startup already probed

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("health check loop stopped");
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn tick(&self) {
        let up = self.remote.ping().await;
        let was = self.healthy.load(Ordering::Relaxed);
        if up && !was {
            // Replay must complete before the flag flips, or reads would see
            // the stale remote version counters
            if self.replay_pending_bumps().await {
                self.healthy.store(true, Ordering::Relaxed);
                info!("remote cache recovered, leaving degraded mode");
            }
        } else if !up && was {
            self.healthy.store(false, Ordering::Relaxed);
            warn!("remote cache unreachable, entering degraded mode");
        }
    }

    /// Replay version bumps performed while degraded against the remote
    /// counters, so invalidations are not undone by recovery. INCRBY keeps
    /// the counters monotonic even if another instance bumped them in the
    /// meantime; over-counting only costs extra cache misses. Returns true
    /// once nothing is left to replay.
    async fn replay_pending_bumps(&self) -> bool {
        let pending: Vec<(String, i64)> = self
            .pending_bumps
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        for (namespace, delta) in pending {
            let key = version_key(&self.key_prefix, &namespace);
            match self.remote.bump_version_by(&key, delta).await {
                Ok(version) => {
                    self.versions.insert(namespace.clone(), version);
                    // A bump may have landed since the snapshot; only clear
                    // what was replayed.
                    if let Some(mut entry) = self.pending_bumps.get_mut(&namespace) {
                        *entry -= delta;
                    }
                    self.pending_bumps.remove_if(&namespace, |_, v| *v <= 0);
                    info!(namespace = %namespace, version, "replayed degraded-mode invalidation");
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "failed to replay invalidation, staying degraded");
                    return false;
                }
            }
        }

        self.pending_bumps.is_empty()
    }
}
