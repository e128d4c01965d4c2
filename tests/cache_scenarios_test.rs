//! Cache scenarios (SPEC_FULL §8: S1, S2, invariants 1/2/6), run against
//! every reference adapter with the same assertions.

mod support;

use latch::adapter::CacheAdapter;
use latch::event::EventBus;
use latch::key::Namespace;
use latch::Cache;
use std::sync::Arc;
use std::time::Duration;

fn cache_over(adapter: Arc<dyn CacheAdapter>) -> Cache {
    Cache::new(Namespace::new("scenario"), None, adapter, Arc::new(EventBus::default()))
}

/// S1: add idempotence.
async fn add_idempotence(adapter: Arc<dyn CacheAdapter>) {
    let cache = cache_over(adapter);
    assert!(cache.add("a", &1i64, None).await.unwrap());
    assert!(!cache.add("a", &2i64, None).await.unwrap());
    assert_eq!(cache.get::<i64>("a").await.unwrap(), Some(1));
}

/// S2: ttl expiry, overriding the (unset) cache-wide default per call.
async fn ttl_expiry(adapter: Arc<dyn CacheAdapter>) {
    let cache = cache_over(adapter);
    let ttl = Some(chrono::Duration::milliseconds(100));
    assert!(cache.put("a", &1i64, ttl).await.is_ok());
    assert_eq!(cache.get::<i64>("a").await.unwrap(), Some(1));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.get::<i64>("a").await.unwrap(), None);
    assert!(cache.add("a", &2i64, None).await.unwrap());
}

/// Invariant 6: increments compose and are atomic across concurrent callers.
async fn increments_compose_atomically(adapter: Arc<dyn CacheAdapter>) {
    let cache = cache_over(adapter);
    cache.add("counter", &0i64, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache.increment("counter", 1).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(cache.get::<i64>("counter").await.unwrap(), Some(20));
}

#[tokio::test]
async fn memory_add_idempotence() {
    add_idempotence(support::memory_cache().await).await;
}

#[tokio::test]
async fn memory_ttl_expiry() {
    ttl_expiry(support::memory_cache().await).await;
}

#[tokio::test]
async fn memory_increments_compose_atomically() {
    increments_compose_atomically(support::memory_cache().await).await;
}

#[tokio::test]
async fn sql_add_idempotence() {
    add_idempotence(support::sql_cache().await).await;
}

#[tokio::test]
async fn sql_ttl_expiry() {
    ttl_expiry(support::sql_cache().await).await;
}

#[tokio::test]
async fn sql_increments_compose_atomically() {
    increments_compose_atomically(support::sql_cache().await).await;
}

#[tokio::test]
async fn redis_add_idempotence() {
    let Some(adapter) = support::redis_adapter().await else { return };
    add_idempotence(adapter).await;
}

#[tokio::test]
async fn redis_ttl_expiry() {
    let Some(adapter) = support::redis_adapter().await else { return };
    ttl_expiry(adapter).await;
}
