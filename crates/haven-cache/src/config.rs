//! Construction-time configuration for the cache layer.
//!
//! These are plain serde structs meant to be deserialized from the embedding
//! service's configuration file; every field has a default so an empty table
//! yields a working setup (remote store on localhost, local fallback on).

use serde::{Deserialize, Serialize};

/// Remote key-value store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Enable the remote store (gracefully degrades without it).
    #[serde(default = "default_remote_enabled")]
    pub enabled: bool,

    /// Connection URL (e.g., "redis://localhost:6379").
    #[serde(default = "default_remote_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_remote_pool_size")]
    pub pool_size: usize,

    /// Per-operation timeout in milliseconds. Bounds every remote call so no
    /// operation blocks indefinitely.
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_remote_enabled() -> bool {
    true
}

fn default_remote_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_remote_pool_size() -> usize {
    16
}

fn default_remote_timeout_ms() -> u64 {
    5000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: default_remote_enabled(),
            url: default_remote_url(),
            pool_size: default_remote_pool_size(),
            timeout_ms: default_remote_timeout_ms(),
        }
    }
}

/// Cache layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Remote store settings.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Keep an in-process fallback cache for when the remote store is down.
    #[serde(default = "default_local_fallback")]
    pub local_fallback: bool,

    /// Prefix prepended to every physical key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// TTL applied when a write does not specify one, in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// How often the background task probes remote liveness, in milliseconds.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// How often the local cache evicts expired entries, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_local_fallback() -> bool {
    true
}

fn default_key_prefix() -> String {
    "haven".to_string()
}

fn default_ttl_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    300_000 // 5 minutes
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            local_fallback: default_local_fallback(),
            key_prefix: default_key_prefix(),
            default_ttl_ms: default_ttl_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}
