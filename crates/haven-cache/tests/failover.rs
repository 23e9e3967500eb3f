//! Failover behavior against an unreachable remote store.
//!
//! These tests point the remote client at a local port nothing listens on,
//! with tight pool timeouts, so every remote call fails fast. No live Redis
//! is required.

use std::time::Duration;

use haven_cache::{
    Backend, CacheConfig, CacheError, CacheManager, DEFAULT_NAMESPACE, MsetItem, RemoteConfig,
};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("haven_cache=debug")
        .with_test_writer()
        .try_init();
}

fn unreachable_config(local_fallback: bool) -> CacheConfig {
    CacheConfig {
        remote: RemoteConfig {
            enabled: true,
            // Port 1 on loopback: connection refused immediately
            url: "redis://127.0.0.1:1".to_string(),
            pool_size: 2,
            timeout_ms: 200,
        },
        local_fallback,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn manager_starts_degraded_and_serves_locally() {
    init_tracing();
    let cache = CacheManager::new(unreachable_config(true)).await.unwrap();

    assert!(!cache.is_healthy());
    assert!(!cache.ping().await);

    cache
        .set("settings", &json!({"theme": "dark"}), None, DEFAULT_NAMESPACE)
        .await
        .unwrap();
    let value: Option<serde_json::Value> =
        cache.get("settings", DEFAULT_NAMESPACE).await.unwrap();
    assert_eq!(value, Some(json!({"theme": "dark"})));

    let stats = cache.stats().await;
    assert_eq!(stats.backend, Backend::Local);
    assert!(!stats.healthy);
    assert_eq!(stats.sets, 1);

    cache.destroy();
}

#[tokio::test]
async fn set_then_expiry_in_degraded_mode() {
    init_tracing();
    let cache = CacheManager::new(unreachable_config(true)).await.unwrap();

    cache
        .set("x", &42, Some(Duration::from_millis(1000)), "files")
        .await
        .unwrap();
    let hit: Option<i64> = cache.get("x", "files").await.unwrap();
    assert_eq!(hit, Some(42));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let miss: Option<i64> = cache.get("x", "files").await.unwrap();
    assert_eq!(miss, None);

    cache.destroy();
}

#[tokio::test]
async fn namespace_invalidation_works_while_degraded() {
    init_tracing();
    let cache = CacheManager::new(unreachable_config(true)).await.unwrap();

    cache.set("x", &1, None, "files").await.unwrap();
    let version = cache.invalidate_namespace("files").await.unwrap();
    assert_eq!(version, 2);

    let miss: Option<i64> = cache.get("x", "files").await.unwrap();
    assert_eq!(miss, None);

    cache.set("x", &2, None, "files").await.unwrap();
    let hit: Option<i64> = cache.get("x", "files").await.unwrap();
    assert_eq!(hit, Some(2));

    cache.destroy();
}

#[tokio::test]
async fn mset_falls_back_to_local() {
    init_tracing();
    let cache = CacheManager::new(unreachable_config(true)).await.unwrap();

    let items = vec![
        MsetItem::new("a", &1).unwrap().with_namespace("dash"),
        MsetItem::new("b", &2).unwrap().with_namespace("dash"),
    ];
    let outcome = cache.mset(items).await.unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.failed, 0);

    let a: Option<i64> = cache.get("a", "dash").await.unwrap();
    assert_eq!(a, Some(1));

    cache.destroy();
}

#[tokio::test]
async fn diagnostics_surface_remote_errors_directly() {
    init_tracing();
    let cache = CacheManager::new(unreachable_config(true)).await.unwrap();

    let err = cache.key_info("x", "files").await.unwrap_err();
    assert!(err.is_remote_unavailable());
    let err = cache.list_keys("haven:*").await.unwrap_err();
    assert!(err.is_remote_unavailable());

    cache.destroy();
}

#[tokio::test]
async fn without_fallback_data_path_errors_surface() {
    init_tracing();
    let cache = CacheManager::new(unreachable_config(false)).await.unwrap();

    let err = cache.set("k", &1, None, DEFAULT_NAMESPACE).await.unwrap_err();
    assert!(err.is_remote_unavailable());
    let err = cache.get::<i64>("k", DEFAULT_NAMESPACE).await.unwrap_err();
    assert!(err.is_remote_unavailable());

    cache.destroy();
}

#[tokio::test]
async fn destroy_is_safe_with_inflight_state() {
    init_tracing();
    let cache = CacheManager::new(unreachable_config(true)).await.unwrap();
    cache.set("k", &1, None, DEFAULT_NAMESPACE).await.unwrap();

    cache.destroy();
    cache.destroy();

    let err = cache.delete("k", DEFAULT_NAMESPACE).await.unwrap_err();
    assert!(matches!(err, CacheError::Closed));
}
