//! Cross-process handle (de)serialization (component C7)
//!
//! Lock and shared-lock handles carry no state a remote process can
//! trust on its own — only an owner ID and a key are meaningful once
//! rejoined to a live adapter. A [`LockTransformer`]/[`SharedLockTransformer`]
//! is that rejoining point: built once against a fixed `(name, namespace,
//! adapter)` triple (§4.7), it serializes a handle to a small bounded
//! record and reconstructs a functioning handle from one, refusing any
//! record whose triple it wasn't built for.

use crate::error::{Error, Result};
use crate::key::{Key, Namespace};
use crate::lock::Lock;
use crate::shared_lock::SharedLock;
use crate::adapter::{LockAdapter, SharedLockAdapter};
use crate::event::EventBus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const RECORD_VERSION: &str = "1";

/// The bounded wire record for a [`Lock`] handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHandleRecord {
    pub version: String,
    pub key: String,
    pub lock_id: String,
    pub ttl_in_ms: Option<i64>,
}

/// The bounded wire record for a [`SharedLock`] handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedLockHandleRecord {
    pub version: String,
    pub key: String,
    pub lock_id: String,
    pub limit: usize,
    pub ttl_in_ms: Option<i64>,
}

fn mismatch(triple_kind: &'static str) -> Error {
    Error::unexpected("serde_transformer", anyhow::anyhow!("handle does not match the {triple_kind} transformer's (name, namespace, adapter) triple"))
}

fn bad_version(found: &str) -> Error {
    Error::unexpected("serde_transformer", anyhow::anyhow!("unsupported record version: {found}"))
}

fn bad_uuid(source: uuid::Error) -> Error {
    Error::unexpected("serde_transformer", source)
}

/// Transforms [`Lock`] handles scoped to `namespace` and `adapter`,
/// identified externally by `name`.
pub struct LockTransformer {
    name: String,
    namespace: Namespace,
    adapter: Arc<dyn LockAdapter>,
    events: Arc<EventBus>,
    default_blocking_time: Duration,
    default_blocking_interval: Duration,
}

impl LockTransformer {
    pub fn new(
        name: impl Into<String>,
        namespace: Namespace,
        adapter: Arc<dyn LockAdapter>,
        events: Arc<EventBus>,
        default_blocking_time: Duration,
        default_blocking_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            namespace,
            adapter,
            events,
            default_blocking_time,
            default_blocking_interval,
        }
    }

    /// The `(name, namespace, adapter_type_tag)` triple this transformer
    /// was built for.
    pub fn triple(&self) -> (&str, String, &'static str) {
        (&self.name, self.namespace.to_string(), self.adapter.type_tag())
    }

    fn matches(&self, lock: &Lock) -> bool {
        lock.key().starts_with(&self.namespace) && lock.adapter_type_tag() == self.adapter.type_tag()
    }

    pub fn serialize(&self, lock: &Lock) -> Result<String> {
        if !self.matches(lock) {
            return Err(mismatch("lock"));
        }
        let record = LockHandleRecord {
            version: RECORD_VERSION.to_string(),
            key: lock.key().storage_key(),
            lock_id: lock.owner_id().to_string(),
            ttl_in_ms: lock.ttl().map(|d| d.num_milliseconds()),
        };
        Ok(serde_json::to_string(&record)?)
    }

    pub fn deserialize(&self, raw: &str) -> Result<Lock> {
        let record: LockHandleRecord = serde_json::from_str(raw)?;
        if record.version != RECORD_VERSION {
            return Err(bad_version(&record.version));
        }
        let key = Key::from_storage_key(&record.key);
        if !key.starts_with(&self.namespace) {
            return Err(mismatch("lock"));
        }
        let owner_id = Uuid::parse_str(&record.lock_id).map_err(bad_uuid)?;
        let ttl = record.ttl_in_ms.map(chrono::Duration::milliseconds);
        Ok(Lock::with_owner_id(
            key,
            owner_id,
            ttl,
            self.adapter.clone(),
            self.events.clone(),
            self.default_blocking_time,
            self.default_blocking_interval,
        ))
    }
}

/// Transforms [`SharedLock`] handles scoped to `namespace` and `adapter`.
pub struct SharedLockTransformer {
    name: String,
    namespace: Namespace,
    adapter: Arc<dyn SharedLockAdapter>,
    events: Arc<EventBus>,
}

impl SharedLockTransformer {
    pub fn new(name: impl Into<String>, namespace: Namespace, adapter: Arc<dyn SharedLockAdapter>, events: Arc<EventBus>) -> Self {
        Self {
            name: name.into(),
            namespace,
            adapter,
            events,
        }
    }

    pub fn triple(&self) -> (&str, String, &'static str) {
        (&self.name, self.namespace.to_string(), self.adapter.type_tag())
    }

    fn matches(&self, lock: &SharedLock) -> bool {
        lock.key().starts_with(&self.namespace) && lock.adapter_type_tag() == self.adapter.type_tag()
    }

    pub fn serialize(&self, lock: &SharedLock) -> Result<String> {
        if !self.matches(lock) {
            return Err(mismatch("shared lock"));
        }
        let record = SharedLockHandleRecord {
            version: RECORD_VERSION.to_string(),
            key: lock.key().storage_key(),
            lock_id: lock.owner_id().to_string(),
            limit: lock.reader_limit(),
            ttl_in_ms: lock.ttl().map(|d| d.num_milliseconds()),
        };
        Ok(serde_json::to_string(&record)?)
    }

    pub fn deserialize(&self, raw: &str) -> Result<SharedLock> {
        let record: SharedLockHandleRecord = serde_json::from_str(raw)?;
        if record.version != RECORD_VERSION {
            return Err(bad_version(&record.version));
        }
        let key = Key::from_storage_key(&record.key);
        if !key.starts_with(&self.namespace) {
            return Err(mismatch("shared lock"));
        }
        let owner_id = Uuid::parse_str(&record.lock_id).map_err(bad_uuid)?;
        let ttl = record.ttl_in_ms.map(chrono::Duration::milliseconds);
        Ok(SharedLock::with_owner_id(key, owner_id, record.limit, ttl, self.adapter.clone(), self.events.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::{MemoryLockAdapter, MemorySharedLockAdapter};

    #[test]
    fn lock_round_trips_through_a_record() {
        let adapter: Arc<dyn LockAdapter> = Arc::new(MemoryLockAdapter::new());
        let events = Arc::new(EventBus::default());
        let namespace = Namespace::new("app").group("locks");
        let transformer = LockTransformer::new("primary", namespace.clone(), adapter.clone(), events.clone(), Duration::from_secs(1), Duration::from_millis(10));

        let original = Lock::new(namespace.create(["job-42"]), Some(chrono::Duration::seconds(30)), adapter, events, Duration::from_secs(1), Duration::from_millis(10));
        let raw = transformer.serialize(&original).unwrap();
        let rebuilt = transformer.deserialize(&raw).unwrap();

        assert_eq!(rebuilt.owner_id(), original.owner_id());
        assert_eq!(rebuilt.key().storage_key(), original.key().storage_key());
        assert_eq!(rebuilt.ttl(), original.ttl());
    }

    #[test]
    fn lock_from_a_different_namespace_is_rejected() {
        let adapter: Arc<dyn LockAdapter> = Arc::new(MemoryLockAdapter::new());
        let events = Arc::new(EventBus::default());
        let namespace = Namespace::new("app").group("locks");
        let transformer = LockTransformer::new("primary", namespace, adapter.clone(), events.clone(), Duration::from_secs(1), Duration::from_millis(10));

        let other_namespace = Namespace::new("other");
        let foreign = Lock::new(other_namespace.create(["job-42"]), None, adapter, events, Duration::from_secs(1), Duration::from_millis(10));

        assert!(transformer.serialize(&foreign).is_err());
    }

    #[test]
    fn shared_lock_round_trips_through_a_record() {
        let adapter: Arc<dyn SharedLockAdapter> = Arc::new(MemorySharedLockAdapter::new());
        let events = Arc::new(EventBus::default());
        let namespace = Namespace::new("app").group("shared");
        let transformer = SharedLockTransformer::new("primary", namespace.clone(), adapter.clone(), events.clone());

        let original = SharedLock::new(namespace.create(["doc-1"]), 3, None, adapter, events);
        let raw = transformer.serialize(&original).unwrap();
        let rebuilt = transformer.deserialize(&raw).unwrap();

        assert_eq!(rebuilt.owner_id(), original.owner_id());
        assert_eq!(rebuilt.reader_limit(), 3);
    }
}
