//! Provider composition root (component C8)
//!
//! A [`Provider`] is the single place that owns the backing adapters, the
//! event bus, and the timing/retry defaults every `Cache`/`Lock`/`SharedLock`
//! handle it hands out closes over. Layering follows the teacher's
//! `SaasConfig::from_env` in `saas_app.rs`: explicit [`ProviderConfig`] fields
//! override environment variables, which override hardcoded defaults —
//! never the reverse.

use crate::adapter::{CacheAdapter, LockAdapter, SharedLockAdapter};
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::key::Namespace;
use crate::lock::Lock;
use crate::retry::{exponential_backoff, RetryPolicy};
use crate::shared_lock::SharedLock;
use std::sync::Arc;
use std::time::Duration;

/// Construction-time configuration for a [`Provider`] (§6.3). Every field
/// has a hardcoded default; [`ProviderConfig::from_env`] overlays
/// environment variables on top of those defaults, and fields set directly
/// on the returned struct before calling [`Provider::builder`] take final
/// precedence.
#[derive(Clone)]
pub struct ProviderConfig {
    pub namespace: Namespace,
    pub default_ttl: Option<chrono::Duration>,
    pub retry_policy: RetryPolicy,
    pub timeout: Option<Duration>,
    pub default_blocking_time: Duration,
    pub default_blocking_interval: Duration,
    pub default_refresh_time: Duration,
    pub expired_keys_removal_interval: Duration,
    pub should_remove_expired_keys: bool,
    pub reader_limit: usize,
    pub event_bus_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            namespace: Namespace::new("latch"),
            default_ttl: None,
            retry_policy: RetryPolicy::default(),
            timeout: None,
            default_blocking_time: Duration::from_secs(5),
            default_blocking_interval: Duration::from_millis(50),
            default_refresh_time: Duration::from_secs(30),
            expired_keys_removal_interval: Duration::from_secs(60),
            should_remove_expired_keys: true,
            reader_limit: 1,
            event_bus_capacity: 1024,
        }
    }
}

impl ProviderConfig {
    /// Overlay environment variables onto the hardcoded defaults. Unset or
    /// unparseable variables silently fall back to the default they would
    /// otherwise have, mirroring the teacher's `unwrap_or_else` overlay in
    /// `saas_app.rs::SaasConfig::from_env`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            namespace: std::env::var("LATCH_NAMESPACE").map(Namespace::new).unwrap_or(defaults.namespace),
            default_ttl: std::env::var("LATCH_DEFAULT_TTL_MS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .map(chrono::Duration::milliseconds)
                .or(defaults.default_ttl),
            retry_policy: std::env::var("LATCH_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .map(|attempts| RetryPolicy::new(attempts, exponential_backoff(Duration::from_millis(10), Duration::from_secs(1))))
                .unwrap_or(defaults.retry_policy),
            timeout: std::env::var("LATCH_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .or(defaults.timeout),
            default_blocking_time: duration_from_env_millis("LATCH_DEFAULT_BLOCKING_TIME_MS").unwrap_or(defaults.default_blocking_time),
            default_blocking_interval: duration_from_env_millis("LATCH_DEFAULT_BLOCKING_INTERVAL_MS").unwrap_or(defaults.default_blocking_interval),
            default_refresh_time: duration_from_env_millis("LATCH_DEFAULT_REFRESH_TIME_MS").unwrap_or(defaults.default_refresh_time),
            expired_keys_removal_interval: duration_from_env_millis("LATCH_EXPIRED_KEYS_REMOVAL_INTERVAL_MS").unwrap_or(defaults.expired_keys_removal_interval),
            should_remove_expired_keys: std::env::var("LATCH_SHOULD_REMOVE_EXPIRED_KEYS")
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(defaults.should_remove_expired_keys),
            reader_limit: std::env::var("LATCH_READER_LIMIT").ok().and_then(|v| v.parse::<usize>().ok()).unwrap_or(defaults.reader_limit),
            event_bus_capacity: std::env::var("LATCH_EVENT_BUS_CAPACITY").ok().and_then(|v| v.parse::<usize>().ok()).unwrap_or(defaults.event_bus_capacity),
        }
    }
}

fn duration_from_env_millis(var: &str) -> Option<Duration> {
    std::env::var(var).ok().and_then(|v| v.parse::<u64>().ok()).map(Duration::from_millis)
}

/// A builder binding a [`ProviderConfig`] to a concrete triple of adapters.
pub struct ProviderBuilder {
    config: ProviderConfig,
    cache_adapter: Option<Arc<dyn CacheAdapter>>,
    lock_adapter: Option<Arc<dyn LockAdapter>>,
    shared_lock_adapter: Option<Arc<dyn SharedLockAdapter>>,
    events: Option<Arc<EventBus>>,
}

impl ProviderBuilder {
    fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            cache_adapter: None,
            lock_adapter: None,
            shared_lock_adapter: None,
            events: None,
        }
    }

    pub fn cache_adapter(mut self, adapter: Arc<dyn CacheAdapter>) -> Self {
        self.cache_adapter = Some(adapter);
        self
    }

    pub fn lock_adapter(mut self, adapter: Arc<dyn LockAdapter>) -> Self {
        self.lock_adapter = Some(adapter);
        self
    }

    pub fn shared_lock_adapter(mut self, adapter: Arc<dyn SharedLockAdapter>) -> Self {
        self.shared_lock_adapter = Some(adapter);
        self
    }

    /// Override the provider's event bus instead of building a fresh one
    /// from `ProviderConfig::event_bus_capacity`.
    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Finish construction, calling `init()` on every supplied adapter
    /// (idempotent per [`crate::adapter::AdapterLifecycle`]).
    pub async fn build(self) -> Result<Provider> {
        let events = self.events.unwrap_or_else(|| Arc::new(EventBus::new(self.config.event_bus_capacity)));

        if let Some(adapter) = &self.cache_adapter {
            adapter.init().await?;
        }
        if let Some(adapter) = &self.lock_adapter {
            adapter.init().await?;
        }
        if let Some(adapter) = &self.shared_lock_adapter {
            adapter.init().await?;
        }

        Ok(Provider {
            config: self.config,
            cache_adapter: self.cache_adapter,
            lock_adapter: self.lock_adapter,
            shared_lock_adapter: self.shared_lock_adapter,
            events,
        })
    }
}

/// The composition root handing out namespaced `Cache`/`Lock`/`SharedLock`
/// handles over a shared set of adapters, event bus, and defaults.
pub struct Provider {
    config: ProviderConfig,
    cache_adapter: Option<Arc<dyn CacheAdapter>>,
    lock_adapter: Option<Arc<dyn LockAdapter>>,
    shared_lock_adapter: Option<Arc<dyn SharedLockAdapter>>,
    events: Arc<EventBus>,
}

impl Provider {
    pub fn builder(config: ProviderConfig) -> ProviderBuilder {
        ProviderBuilder::new(config)
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry_policy.clone()
    }

    /// Hand out a `Cache` scoped under the provider's namespace plus
    /// `group`.
    pub fn cache(&self, group: &str) -> Result<Cache> {
        let adapter = self.cache_adapter.clone().ok_or_else(|| Error::UnregisteredDriver("cache".into()))?;
        Ok(Cache::new(self.config.namespace.group(group), self.config.default_ttl, adapter, self.events.clone()))
    }

    /// Hand out a `Lock` for `key` under `group`, using the provider's
    /// blocking-acquire defaults.
    pub fn lock(&self, group: &str, key: &str) -> Result<Lock> {
        let adapter = self.lock_adapter.clone().ok_or_else(|| Error::UnregisteredDriver("lock".into()))?;
        let namespace = self.config.namespace.group(group);
        Ok(Lock::new(
            namespace.create([key]),
            self.config.default_ttl,
            adapter,
            self.events.clone(),
            self.config.default_blocking_time,
            self.config.default_blocking_interval,
        ))
    }

    /// Hand out a `SharedLock` for `key` under `group`, using the
    /// provider's configured reader limit.
    pub fn shared_lock(&self, group: &str, key: &str) -> Result<SharedLock> {
        let adapter = self.shared_lock_adapter.clone().ok_or_else(|| Error::UnregisteredDriver("shared_lock".into()))?;
        let namespace = self.config.namespace.group(group);
        Ok(SharedLock::new(namespace.create([key]), self.config.reader_limit, self.config.default_ttl, adapter, self.events.clone()))
    }

    /// Run `de_init` on every configured adapter, stopping sweeper tasks.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(adapter) = &self.cache_adapter {
            adapter.de_init().await?;
        }
        if let Some(adapter) = &self.lock_adapter {
            adapter.de_init().await?;
        }
        if let Some(adapter) = &self.shared_lock_adapter {
            adapter.de_init().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::{MemoryCacheAdapter, MemoryLockAdapter, MemorySharedLockAdapter};

    async fn provider() -> Provider {
        Provider::builder(ProviderConfig::default())
            .cache_adapter(Arc::new(MemoryCacheAdapter::new()))
            .lock_adapter(Arc::new(MemoryLockAdapter::new()))
            .shared_lock_adapter(Arc::new(MemorySharedLockAdapter::new()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cache_handle_round_trips_through_provider() {
        let provider = provider().await;
        let cache = provider.cache("sessions").unwrap();
        cache.add("a", &1i64, None).await.unwrap();
        assert_eq!(cache.get::<i64>("a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn lock_handle_is_scoped_under_group() {
        let provider = provider().await;
        let lock = provider.lock("jobs", "job-1").unwrap();
        assert_eq!(lock.key().storage_key(), "latch/jobs/job-1");
        assert!(lock.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn unregistered_adapter_fails_with_unregistered_driver() {
        let provider = Provider::builder(ProviderConfig::default()).build().await.unwrap();
        assert!(matches!(provider.cache("x"), Err(Error::UnregisteredDriver(_))));
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        std::env::remove_var("LATCH_READER_LIMIT");
        let config = ProviderConfig::from_env();
        assert_eq!(config.reader_limit, ProviderConfig::default().reader_limit);
    }
}
