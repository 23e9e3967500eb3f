//! Resilient cache layer for the Haven file-hosting backend.
//!
//! Keeps hot read paths (settings, aggregate stats, dashboard queries) off
//! the database and external storage, and keeps serving them when the remote
//! key-value store goes away.
//!
//! ## Architecture
//!
//! ```text
//! caller → CacheManager → RemoteCache (Redis)        while healthy
//!                       → LocalFallbackCache (DashMap) while degraded
//! ```
//!
//! - [`RemoteCache`]: Redis client over a connection pool; every call is
//!   bounded by the pool's timeouts and fails with `RemoteUnavailable`.
//! - [`LocalFallbackCache`]: in-process TTL store with a periodic sweep.
//! - [`CacheManager`]: owns the health state, fails over per operation,
//!   and implements namespace-scoped keys with O(1) version-based bulk
//!   invalidation.
//!
//! ## Graceful degradation
//!
//! A failed remote call degrades the manager and retries the same operation
//! locally; a 30-second background probe flips it back once the store
//! answers again. Callers see degraded latency/consistency, not errors. A
//! cache failure must never block the primary data path: treat any surfaced
//! cache error as a cue to go to the source of truth.
//!
//! ## Ownership
//!
//! There is no global instance. The service's startup sequence constructs a
//! [`CacheManager`] and its shutdown sequence calls
//! [`CacheManager::destroy`] exactly once.

pub mod config;
pub mod error;
pub mod local;
pub mod manager;
pub mod remote;
pub mod stats;

pub use config::{CacheConfig, RemoteConfig};
pub use error::{CacheError, CacheResult};
pub use local::LocalFallbackCache;
pub use manager::{CacheManager, DEFAULT_NAMESPACE, MsetItem, MsetOutcome};
pub use remote::{KeyInfo, RemoteCache};
pub use stats::{Backend, CacheStats};
