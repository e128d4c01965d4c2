//! Shared harness for the scenario suites (§8). Each scenario function is
//! written once against the adapter traits and exercised against every
//! reference adapter, the way `geometry_3d_integration_test.rs` exercises
//! one API surface across several primitive shapes.
//!
//! Each `tests/*.rs` file is compiled as its own crate and only calls a
//! subset of these helpers, so `dead_code` here is expected rather than a
//! real unused-function defect.
#![allow(dead_code)]

use latch::adapter::memory::{MemoryCacheAdapter, MemoryLockAdapter, MemorySharedLockAdapter};
use latch::adapter::redis::RedisAdapter;
use latch::adapter::sql::{SqlAdapter, SqlAdapterConfig};
use latch::adapter::{AdapterLifecycle, CacheAdapter, LockAdapter, SharedLockAdapter};
use std::sync::Arc;

pub async fn memory_cache() -> Arc<dyn CacheAdapter> {
    Arc::new(MemoryCacheAdapter::new())
}

pub async fn memory_lock() -> Arc<dyn LockAdapter> {
    Arc::new(MemoryLockAdapter::new())
}

pub async fn memory_shared_lock() -> Arc<dyn SharedLockAdapter> {
    Arc::new(MemorySharedLockAdapter::new())
}

async fn sql_adapter() -> Arc<SqlAdapter> {
    let adapter = SqlAdapter::connect(SqlAdapterConfig {
        url: "sqlite::memory:".to_string(),
        ..SqlAdapterConfig::default()
    })
    .await
    .expect("connect in-memory sqlite");
    adapter.init().await.expect("init schema");
    Arc::new(adapter)
}

pub async fn sql_cache() -> Arc<dyn CacheAdapter> {
    sql_adapter().await
}

pub async fn sql_lock() -> Arc<dyn LockAdapter> {
    sql_adapter().await
}

pub async fn sql_shared_lock() -> Arc<dyn SharedLockAdapter> {
    sql_adapter().await
}

/// `None` when `LATCH_TEST_REDIS_URL` isn't set; callers skip the scenario
/// rather than failing, matching `adapter::redis`'s own test gating.
pub async fn redis_adapter() -> Option<Arc<RedisAdapter>> {
    let url = std::env::var("LATCH_TEST_REDIS_URL").ok()?;
    let adapter = RedisAdapter::connect(&url).await.expect("connect to redis");
    Some(Arc::new(adapter))
}
