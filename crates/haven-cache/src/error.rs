use thiserror::Error;

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error types for cache operations.
///
/// A cache miss is never an error: data-path operations return `Ok(None)`
/// for absent or expired keys.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The remote store could not be reached (network, timeout, pool or
    /// protocol failure). Triggers failover to the local cache when one is
    /// configured.
    #[error("remote cache unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    /// The manager was used after `destroy()`.
    #[error("cache manager is closed")]
    Closed,

    /// The caller's value could not be serialized, or a stored record could
    /// not be deserialized. Never retried and never triggers failover.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid construction-time settings.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Create a new RemoteUnavailable error
    pub fn remote_unavailable(reason: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error should trigger failover to the local cache.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::RemoteUnavailable {
            reason: err.to_string(),
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::RemoteUnavailable {
            reason: err.to_string(),
        }
    }
}
