//! In-memory reference adapter (component C9)
//!
//! `DashMap`-backed, used for the in-process scenario suite in `tests/`.
//! Expiration is enforced at read time (an expired row is treated as
//! absent and only actually evicted the next time the same key is
//! written), the same approach the teacher's `DistributedMutex`/
//! `DistributedRwLock` (`enterprise/cache/lock.rs`) use for their
//! `DashMap<K, LockHolder>` tables. No real transaction is needed here:
//! `DashMap`'s per-shard locking already gives per-key atomicity, which is
//! all every operation below requires.

use super::{AdapterLifecycle, CacheAdapter, LockAdapter, LockRow, SharedLockAdapter, SharedLockRow};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;

fn expires_at(ttl: Option<ChronoDuration>) -> Option<DateTime<Utc>> {
    ttl.map(|d| Utc::now() + d)
}

fn is_live(expiration: &Option<DateTime<Utc>>) -> bool {
    match expiration {
        Some(exp) => *exp > Utc::now(),
        None => true,
    }
}

#[derive(Clone)]
struct StoredValue {
    value: String,
    expiration: Option<DateTime<Utc>>,
}

/// In-memory [`CacheAdapter`].
#[derive(Default)]
pub struct MemoryCacheAdapter {
    data: DashMap<String, StoredValue>,
}

impl MemoryCacheAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdapterLifecycle for MemoryCacheAdapter {}

#[async_trait]
impl CacheAdapter for MemoryCacheAdapter {
    fn type_tag(&self) -> &'static str {
        "memory-cache"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .data
            .get(key)
            .filter(|v| is_live(&v.expiration))
            .map(|v| v.value.clone()))
    }

    async fn get_and_remove(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.remove_if(key, |_, v| is_live(&v.expiration)).map(|(_, v)| v.value))
    }

    async fn add(&self, key: &str, value: &str, ttl: Option<ChronoDuration>) -> Result<bool> {
        let mut inserted = false;
        self.data
            .entry(key.to_string())
            .and_modify(|existing| {
                if !is_live(&existing.expiration) {
                    *existing = StoredValue {
                        value: value.to_string(),
                        expiration: expires_at(ttl),
                    };
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                StoredValue {
                    value: value.to_string(),
                    expiration: expires_at(ttl),
                }
            });
        Ok(inserted)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<ChronoDuration>) -> Result<bool> {
        let mut replaced = false;
        self.data
            .entry(key.to_string())
            .and_modify(|existing| {
                replaced = is_live(&existing.expiration);
                *existing = StoredValue {
                    value: value.to_string(),
                    expiration: expires_at(ttl),
                };
            })
            .or_insert_with(|| StoredValue {
                value: value.to_string(),
                expiration: expires_at(ttl),
            });
        Ok(replaced)
    }

    async fn update(&self, key: &str, value: &str) -> Result<bool> {
        if let Some(mut entry) = self.data.get_mut(key) {
            if is_live(&entry.expiration) {
                entry.value = value.to_string();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<bool> {
        let mut existed = false;
        let mut type_error = false;
        self.data.entry(key.to_string()).and_modify(|entry| {
            if is_live(&entry.expiration) {
                existed = true;
                match entry.value.parse::<i64>() {
                    Ok(n) => entry.value = (n + delta).to_string(),
                    Err(_) => type_error = true,
                }
            }
        });
        if type_error {
            return Err(Error::TypeMismatch(key.to_string()));
        }
        Ok(existed)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove_if(key, |_, v| is_live(&v.expiration)).is_some())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        let mut results = HashMap::with_capacity(keys.len());
        for key in keys {
            results.insert(key.clone(), self.remove(key).await?);
        }
        Ok(results)
    }

    async fn remove_by_key_prefix(&self, prefix: &str) -> Result<u64> {
        let to_remove: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let mut count = 0u64;
        for key in to_remove {
            if self.data.remove(&key).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn remove_all(&self) -> Result<u64> {
        let count = self.data.len() as u64;
        self.data.clear();
        Ok(count)
    }
}

/// In-memory [`LockAdapter`].
#[derive(Default)]
pub struct MemoryLockAdapter {
    data: DashMap<String, LockRow>,
}

impl MemoryLockAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdapterLifecycle for MemoryLockAdapter {}

#[async_trait]
impl LockAdapter for MemoryLockAdapter {
    fn type_tag(&self) -> &'static str {
        "memory-lock"
    }

    async fn insert(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let mut inserted = false;
        self.data
            .entry(key.to_string())
            .and_modify(|row| {
                if !is_live(&row.expiration) {
                    *row = LockRow {
                        owner: owner.to_string(),
                        expiration,
                    };
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                LockRow {
                    owner: owner.to_string(),
                    expiration,
                }
            });
        Ok(inserted)
    }

    async fn update(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        if let Some(mut row) = self.data.get_mut(key) {
            if !is_live(&row.expiration) {
                *row = LockRow {
                    owner: owner.to_string(),
                    expiration,
                };
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn remove(&self, key: &str, owner: Option<&str>) -> Result<bool> {
        match owner {
            Some(owner) => Ok(self.data.remove_if(key, |_, row| row.owner == owner).is_some()),
            None => Ok(self.data.remove(key).is_some()),
        }
    }

    async fn refresh(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        if let Some(mut row) = self.data.get_mut(key) {
            if row.owner == owner && is_live(&row.expiration) {
                row.expiration = expiration;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn find(&self, key: &str) -> Result<Option<LockRow>> {
        Ok(self.data.get(key).filter(|row| is_live(&row.expiration)).map(|row| row.clone()))
    }
}

enum InternalShape {
    Writer(LockRow),
    Readers { limit: usize, slots: HashMap<String, Option<DateTime<Utc>>> },
}

/// In-memory [`SharedLockAdapter`]. One `DashMap` row per key, holding
/// either the writer shape or the reader-slot map — never both, matching
/// the §3.4 invariant that a key is in at most one shape at a time.
#[derive(Default)]
pub struct MemorySharedLockAdapter {
    data: DashMap<String, InternalShape>,
}

impl MemorySharedLockAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdapterLifecycle for MemorySharedLockAdapter {}

#[async_trait]
impl SharedLockAdapter for MemorySharedLockAdapter {
    fn type_tag(&self) -> &'static str {
        "memory-shared-lock"
    }

    async fn acquire_reader(
        &self,
        key: &str,
        owner: &str,
        limit: usize,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut granted = false;
        self.data
            .entry(key.to_string())
            .and_modify(|shape| match shape {
                InternalShape::Writer(row) if is_live(&row.expiration) => {
                    granted = false;
                }
                InternalShape::Writer(_) => {
                    granted = true;
                    *shape = InternalShape::Readers {
                        limit,
                        slots: HashMap::from([(owner.to_string(), expiration)]),
                    };
                }
                InternalShape::Readers { limit: stored_limit, slots } => {
                    slots.retain(|_, exp| is_live(exp));
                    if slots.contains_key(owner) || slots.len() < *stored_limit {
                        slots.insert(owner.to_string(), expiration);
                        granted = true;
                    } else {
                        granted = false;
                    }
                }
            })
            .or_insert_with(|| {
                granted = true;
                InternalShape::Readers {
                    limit,
                    slots: HashMap::from([(owner.to_string(), expiration)]),
                }
            });
        Ok(granted)
    }

    async fn acquire_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        let mut granted = false;
        self.data
            .entry(key.to_string())
            .and_modify(|shape| match shape {
                InternalShape::Readers { slots, .. } => {
                    slots.retain(|_, exp| is_live(exp));
                    if slots.is_empty() {
                        granted = true;
                        *shape = InternalShape::Writer(LockRow {
                            owner: owner.to_string(),
                            expiration,
                        });
                    } else {
                        granted = false;
                    }
                }
                InternalShape::Writer(row) => {
                    if row.owner == owner || !is_live(&row.expiration) {
                        granted = true;
                        *row = LockRow {
                            owner: owner.to_string(),
                            expiration,
                        };
                    } else {
                        granted = false;
                    }
                }
            })
            .or_insert_with(|| {
                granted = true;
                InternalShape::Writer(LockRow {
                    owner: owner.to_string(),
                    expiration,
                })
            });
        Ok(granted)
    }

    async fn release_reader(&self, key: &str, owner: &str) -> Result<bool> {
        let mut removed = false;
        let mut now_empty = false;
        if let Some(mut shape) = self.data.get_mut(key) {
            if let InternalShape::Readers { slots, .. } = shape.value_mut() {
                removed = slots.remove(owner).is_some();
                now_empty = slots.is_empty();
            }
        }
        if now_empty {
            self.data.remove_if(key, |_, shape| matches!(shape, InternalShape::Readers { slots, .. } if slots.is_empty()));
        }
        Ok(removed)
    }

    async fn release_writer(&self, key: &str, owner: &str) -> Result<bool> {
        Ok(self
            .data
            .remove_if(key, |_, shape| matches!(shape, InternalShape::Writer(row) if row.owner == owner))
            .is_some())
    }

    async fn refresh_reader(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        if let Some(mut shape) = self.data.get_mut(key) {
            if let InternalShape::Readers { slots, .. } = shape.value_mut() {
                if let Some(slot) = slots.get_mut(owner) {
                    *slot = expiration;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn refresh_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool> {
        if let Some(mut shape) = self.data.get_mut(key) {
            if let InternalShape::Writer(row) = shape.value_mut() {
                if row.owner == owner {
                    row.expiration = expiration;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn force_release_all_readers(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove_if(key, |_, shape| matches!(shape, InternalShape::Readers { .. })).is_some())
    }

    async fn force_release_writer(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove_if(key, |_, shape| matches!(shape, InternalShape::Writer(_))).is_some())
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn get_state(&self, key: &str) -> Result<SharedLockRow> {
        let Some(mut shape) = self.data.get_mut(key) else {
            return Ok(SharedLockRow::Absent);
        };
        match shape.value_mut() {
            InternalShape::Writer(row) if is_live(&row.expiration) => Ok(SharedLockRow::Writer {
                owner: row.owner.clone(),
                expiration: row.expiration,
            }),
            InternalShape::Writer(_) => Ok(SharedLockRow::Absent),
            InternalShape::Readers { limit, slots } => {
                slots.retain(|_, exp| is_live(exp));
                if slots.is_empty() {
                    Ok(SharedLockRow::Absent)
                } else {
                    Ok(SharedLockRow::Readers {
                        limit: *limit,
                        slots: slots.clone(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_is_a_no_op_when_present() {
        let adapter = MemoryCacheAdapter::new();
        assert!(adapter.add("a", "1", None).await.unwrap());
        assert!(!adapter.add("a", "2", None).await.unwrap());
        assert_eq!(adapter.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn ttl_expiry_makes_key_logically_absent() {
        let adapter = MemoryCacheAdapter::new();
        adapter.add("a", "1", Some(ChronoDuration::milliseconds(20))).await.unwrap();
        assert_eq!(adapter.get("a").await.unwrap(), Some("1".to_string()));
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert_eq!(adapter.get("a").await.unwrap(), None);
        assert!(adapter.add("a", "2", None).await.unwrap());
    }

    #[tokio::test]
    async fn increment_fails_on_non_numeric_value() {
        let adapter = MemoryCacheAdapter::new();
        adapter.add("a", "not-a-number", None).await.unwrap();
        let result = adapter.increment("a", 1).await;
        assert!(matches!(result, Err(Error::TypeMismatch(_))));
    }

    #[tokio::test]
    async fn lock_hand_off_between_owners() {
        let adapter = MemoryLockAdapter::new();
        assert!(adapter.insert("k", "a", None).await.unwrap());
        assert!(!adapter.insert("k", "b", None).await.unwrap());
        assert!(!adapter.remove("k", Some("b")).await.unwrap());
        assert!(adapter.remove("k", Some("a")).await.unwrap());
        assert!(adapter.insert("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn shared_lock_writer_blocks_readers_until_released() {
        let adapter = MemorySharedLockAdapter::new();
        assert!(adapter.acquire_writer("k", "w", None).await.unwrap());
        assert!(!adapter.acquire_reader("k", "r1", 2, None).await.unwrap());
        assert!(adapter.release_writer("k", "w").await.unwrap());
        assert!(adapter.acquire_reader("k", "r1", 2, None).await.unwrap());
        assert!(adapter.acquire_reader("k", "r2", 2, None).await.unwrap());
        assert!(!adapter.acquire_reader("k", "r3", 2, None).await.unwrap());
    }
}
