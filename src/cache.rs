//! TTL-aware cache (component C3)
//!
//! A typed, namespaced front for a [`CacheAdapter`]. Values cross the
//! adapter boundary as `serde_json` text (mirroring the teacher's
//! `CacheEntry { value: serde_json::Value, .. }` in
//! `enterprise::database::cache`); this module owns (de)serialization so
//! adapters only ever see strings.

use crate::adapter::CacheAdapter;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::key::{Key, Namespace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A namespaced handle onto a [`CacheAdapter`].
#[derive(Clone)]
pub struct Cache {
    namespace: Namespace,
    default_ttl: Option<chrono::Duration>,
    adapter: Arc<dyn CacheAdapter>,
    events: Arc<EventBus>,
}

impl Cache {
    pub fn new(namespace: Namespace, default_ttl: Option<chrono::Duration>, adapter: Arc<dyn CacheAdapter>, events: Arc<EventBus>) -> Self {
        Self {
            namespace,
            default_ttl,
            adapter,
            events,
        }
    }

    fn key(&self, segments: impl IntoIterator<Item = impl Into<String>>) -> Key {
        self.namespace.create(segments)
    }

    fn unexpected<T>(&self, method: &'static str, key: Option<String>, err: Error) -> Result<T> {
        log::error!("unexpected error in cache::{method}: {err}");
        self.events.dispatch(Event::UnexpectedError { key, method, error: err.to_string() });
        Err(err)
    }

    /// Read a live value by single-segment key.
    pub async fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let storage_key = self.key([key]).storage_key();
        match self.adapter.get(&storage_key).await {
            Ok(Some(raw)) => {
                self.events.dispatch(Event::KeyFound { key: storage_key });
                Ok(Some(serde_json::from_str(&raw)?))
            }
            Ok(None) => {
                self.events.dispatch(Event::KeyNotFound { key: storage_key });
                Ok(None)
            }
            Err(err) => self.unexpected("get", Some(storage_key), err),
        }
    }

    /// Read, falling back to `default` on miss (never stored).
    pub async fn get_or<V: DeserializeOwned>(&self, key: &str, default: V) -> Result<V> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Read, failing with [`Error::KeyNotFound`] on miss.
    pub async fn get_or_fail<V: DeserializeOwned>(&self, key: &str) -> Result<V> {
        self.get(key).await?.ok_or_else(|| Error::KeyNotFound(self.key([key]).storage_key()))
    }

    /// Insert only if absent (or expired). Returns whether the insert
    /// happened. `ttl` overrides this cache's default when `Some`.
    pub async fn add<V: Serialize>(&self, key: &str, value: &V, ttl: Option<chrono::Duration>) -> Result<bool> {
        let storage_key = self.key([key]).storage_key();
        let raw = serde_json::to_string(value)?;
        match self.adapter.add(&storage_key, &raw, ttl.or(self.default_ttl)).await {
            Ok(true) => {
                self.events.dispatch(Event::KeyAdded { key: storage_key });
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => self.unexpected("add", Some(storage_key), err),
        }
    }

    /// Replace the value of an existing live key. Returns whether it
    /// existed.
    pub async fn update<V: Serialize>(&self, key: &str, value: &V) -> Result<bool> {
        let storage_key = self.key([key]).storage_key();
        let raw = serde_json::to_string(value)?;
        match self.adapter.update(&storage_key, &raw).await {
            Ok(true) => {
                self.events.dispatch(Event::KeyUpdated { key: storage_key });
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => self.unexpected("update", Some(storage_key), err),
        }
    }

    /// Upsert, resetting TTL. Returns whether a live value was replaced.
    /// `ttl` overrides this cache's default when `Some`.
    pub async fn put<V: Serialize>(&self, key: &str, value: &V, ttl: Option<chrono::Duration>) -> Result<bool> {
        let storage_key = self.key([key]).storage_key();
        let raw = serde_json::to_string(value)?;
        match self.adapter.put(&storage_key, &raw, ttl.or(self.default_ttl)).await {
            Ok(replaced) => {
                self.events.dispatch(if replaced {
                    Event::KeyUpdated { key: storage_key }
                } else {
                    Event::KeyAdded { key: storage_key }
                });
                Ok(replaced)
            }
            Err(err) => self.unexpected("put", Some(storage_key), err),
        }
    }

    /// Delete a key. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let storage_key = self.key([key]).storage_key();
        match self.adapter.remove(&storage_key).await {
            Ok(true) => {
                self.events.dispatch(Event::KeyRemoved { key: storage_key });
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => self.unexpected("remove", Some(storage_key), err),
        }
    }

    /// Atomic read-then-delete.
    pub async fn get_and_remove<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let storage_key = self.key([key]).storage_key();
        match self.adapter.get_and_remove(&storage_key).await {
            Ok(Some(raw)) => {
                self.events.dispatch(Event::KeyRemoved { key: storage_key });
                Ok(Some(serde_json::from_str(&raw)?))
            }
            Ok(None) => Ok(None),
            Err(err) => self.unexpected("get_and_remove", Some(storage_key), err),
        }
    }

    /// Read on hit; on miss, materialize `make` and `add` it, returning
    /// the materialized value regardless of whether a concurrent caller's
    /// `add` won the race (§4.1: "at-least-once materialization,
    /// last-writer-wins value" — no cross-operation lock is taken). `ttl`
    /// overrides this cache's default when `Some`.
    pub async fn get_or_add<V, F, Fut>(&self, key: &str, make: F, ttl: Option<chrono::Duration>) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let value = make().await?;
        self.add(key, &value, ttl).await?;
        Ok(value)
    }

    /// Atomically add `delta` to a numeric key. Returns whether the key
    /// existed; fails with [`Error::TypeMismatch`] if the stored value
    /// isn't numeric.
    pub async fn increment(&self, key: &str, delta: i64) -> Result<bool> {
        let storage_key = self.key([key]).storage_key();
        match self.adapter.increment(&storage_key, delta).await {
            Ok(existed) => {
                if existed {
                    self.events.dispatch(if delta >= 0 {
                        Event::KeyIncremented { key: storage_key, delta }
                    } else {
                        Event::KeyDecremented { key: storage_key, delta }
                    });
                }
                Ok(existed)
            }
            Err(err) => self.unexpected("increment", Some(storage_key), err),
        }
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Result<bool> {
        self.increment(key, -delta).await
    }

    /// Delete every key under this cache's namespace.
    pub async fn clear(&self) -> Result<u64> {
        let prefix = self.namespace.to_string();
        match self.adapter.remove_by_key_prefix(&prefix).await {
            Ok(count) => {
                self.events.dispatch(Event::KeysCleared { namespace: prefix });
                Ok(count)
            }
            Err(err) => self.unexpected("clear", None, err),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let storage_key = self.key([key]).storage_key();
        Ok(self.adapter.get(&storage_key).await.map_err(|err| {
            log::error!("unexpected error in cache::exists: {err}");
            err
        })?.is_some())
    }

    pub async fn missing(&self, key: &str) -> Result<bool> {
        Ok(!self.exists(key).await?)
    }

    /// Batch `get`.
    pub async fn get_many<V: DeserializeOwned>(&self, keys: &[String]) -> Result<HashMap<String, Option<V>>> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert(key.clone(), self.get(key).await?);
        }
        Ok(results)
    }

    /// Batch `remove`.
    pub async fn remove_many(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        let storage_keys: Vec<String> = keys.iter().map(|k| self.key([k.as_str()]).storage_key()).collect();
        match self.adapter.remove_many(&storage_keys).await {
            Ok(results) => {
                for (storage_key, removed) in &results {
                    if *removed {
                        self.events.dispatch(Event::KeyRemoved { key: storage_key.clone() });
                    }
                }
                // Re-key the result by the caller's original (unprefixed) keys.
                Ok(keys.iter().cloned().zip(storage_keys.iter().map(|k| results.get(k).copied().unwrap_or(false))).collect())
            }
            Err(err) => self.unexpected("remove_many", None, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryCacheAdapter;

    fn cache() -> Cache {
        Cache::new(
            Namespace::new("test"),
            None,
            Arc::new(MemoryCacheAdapter::new()),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let cache = cache();
        assert!(cache.add("a", &42i64, None).await.unwrap());
        assert_eq!(cache.get::<i64>("a").await.unwrap(), Some(42));
        assert!(!cache.add("a", &7i64, None).await.unwrap());
    }

    #[tokio::test]
    async fn get_or_fail_returns_key_not_found() {
        let cache = cache();
        let result: Result<i64> = cache.get_or_fail("missing").await;
        assert!(matches!(result, Err(Error::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn get_or_add_materializes_once_on_hit() {
        let cache = cache();
        let value = cache.get_or_add("a", || async { Ok(99i64) }, None).await.unwrap();
        assert_eq!(value, 99);
        assert_eq!(cache.get::<i64>("a").await.unwrap(), Some(99));
    }

    #[tokio::test]
    async fn increment_and_decrement_track_existence() {
        let cache = cache();
        assert!(!cache.increment("counter", 1).await.unwrap());
        cache.add("counter", &10i64, None).await.unwrap();
        assert!(cache.increment("counter", 5).await.unwrap());
        assert_eq!(cache.get::<i64>("counter").await.unwrap(), Some(15));
        assert!(cache.decrement("counter", 3).await.unwrap());
        assert_eq!(cache.get::<i64>("counter").await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn clear_removes_everything_under_namespace() {
        let cache = cache();
        cache.add("a", &1i64, None).await.unwrap();
        cache.add("b", &2i64, None).await.unwrap();
        let cleared = cache.clear().await.unwrap();
        assert_eq!(cleared, 2);
        assert!(cache.missing("a").await.unwrap());
    }
}
