//! Shared (reader/writer) lock (component C5)
//!
//! Coordinates many readers with a single writer under one atomic state
//! row per key (§3.4), the same shape as the teacher's
//! `DistributedRwLock` but collapsed to a single adapter-owned row
//! instead of two separate `DashMap`s, so the whole reader/writer
//! transition in §4.3.1–4.3.2 is one atomic adapter call rather than a
//! read-then-write pair the core would have to guard itself.

use crate::adapter::{SharedLockAdapter, SharedLockRow};
use crate::error::{Error, Result};
use crate::event::{Event, EventBus, ReaderFailureReason};
use crate::key::Key;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The calling handle's perspective on a shared lock's current state
/// (§4.3.5). Two handles on the same key may observe different
/// projections of the same underlying row.
#[derive(Debug, Clone, PartialEq)]
pub enum SharedLockState {
    /// No writer and no live reader slots.
    Expired,
    /// This handle holds the writer slot.
    WriterAcquired { remaining: Option<ChronoDuration> },
    /// Another owner holds the writer slot.
    WriterUnavailable { owner: String },
    /// This handle holds a reader slot.
    ReaderAcquired {
        limit: usize,
        owner_slots: usize,
        remaining: Option<ChronoDuration>,
    },
    /// This handle does not hold a reader slot, but slots are free.
    ReaderUnacquired {
        limit: usize,
        free_slots: usize,
        acquired_slot_count: usize,
    },
    /// This handle does not hold a reader slot and none are free.
    ReaderLimitReached { limit: usize, acquired_owners: Vec<String> },
}

/// A handle to one named shared lock.
#[derive(Clone)]
pub struct SharedLock {
    key: Key,
    owner_id: Uuid,
    ttl: Option<ChronoDuration>,
    reader_limit: usize,
    adapter: Arc<dyn SharedLockAdapter>,
    events: Arc<EventBus>,
}

impl SharedLock {
    pub fn new(
        key: Key,
        reader_limit: usize,
        ttl: Option<ChronoDuration>,
        adapter: Arc<dyn SharedLockAdapter>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            key,
            owner_id: Uuid::new_v4(),
            ttl,
            reader_limit,
            adapter,
            events,
        }
    }

    pub fn with_owner_id(
        key: Key,
        owner_id: Uuid,
        reader_limit: usize,
        ttl: Option<ChronoDuration>,
        adapter: Arc<dyn SharedLockAdapter>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            key,
            owner_id,
            ttl,
            reader_limit,
            adapter,
            events,
        }
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn ttl(&self) -> Option<ChronoDuration> {
        self.ttl
    }

    pub fn reader_limit(&self) -> usize {
        self.reader_limit
    }

    /// The concrete adapter's stable tag, used by the serde transformer
    /// (§4.7) to confirm a handle targets the adapter a transformer was
    /// registered for.
    pub fn adapter_type_tag(&self) -> &'static str {
        self.adapter.type_tag()
    }

    fn storage_key(&self) -> String {
        self.key.storage_key()
    }

    fn owner_string(&self) -> String {
        self.owner_id.to_string()
    }

    fn expiration(&self) -> Option<DateTime<Utc>> {
        self.ttl.map(|d| Utc::now() + d)
    }

    pub async fn acquire_reader(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.acquire_reader(&storage_key, &owner, self.reader_limit, self.expiration()).await {
            Ok(true) => {
                self.events.dispatch(Event::ReaderAcquired { key: storage_key, owner });
                Ok(true)
            }
            Ok(false) => {
                let reason = match self.adapter.get_state(&storage_key).await {
                    Ok(SharedLockRow::Writer { .. }) => ReaderFailureReason::WriterPresent,
                    _ => ReaderFailureReason::LimitReached,
                };
                self.events.dispatch(Event::ReaderFailedAcquire {
                    key: storage_key,
                    owner,
                    reason,
                });
                Ok(false)
            }
            Err(err) => self.unexpected("acquire_reader", Some(storage_key), err),
        }
    }

    pub async fn acquire_reader_or_fail(&self) -> Result<()> {
        if self.acquire_reader().await? {
            Ok(())
        } else {
            Err(Error::FailedAcquire(self.storage_key()))
        }
    }

    pub async fn acquire_reader_blocking(&self, time: Duration, interval: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + time;
        loop {
            if self.acquire_reader().await? {
                return Ok(true);
            }
            if time.is_zero() || tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn acquire_writer(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.acquire_writer(&storage_key, &owner, self.expiration()).await {
            Ok(true) => {
                self.events.dispatch(Event::WriterAcquired { key: storage_key, owner });
                Ok(true)
            }
            Ok(false) => {
                self.events.dispatch(Event::WriterFailedAcquire { key: storage_key, owner });
                Ok(false)
            }
            Err(err) => self.unexpected("acquire_writer", Some(storage_key), err),
        }
    }

    pub async fn acquire_writer_or_fail(&self) -> Result<()> {
        if self.acquire_writer().await? {
            Ok(())
        } else {
            Err(Error::FailedAcquire(self.storage_key()))
        }
    }

    pub async fn acquire_writer_blocking(&self, time: Duration, interval: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + time;
        loop {
            if self.acquire_writer().await? {
                return Ok(true);
            }
            if time.is_zero() || tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn release_reader(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.release_reader(&storage_key, &owner).await {
            Ok(true) => {
                self.events.dispatch(Event::ReaderReleased { key: storage_key, owner });
                Ok(true)
            }
            Ok(false) => {
                self.events.dispatch(Event::ReaderFailedRelease { key: storage_key, owner });
                Ok(false)
            }
            Err(err) => self.unexpected("release_reader", Some(storage_key), err),
        }
    }

    pub async fn release_writer(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.release_writer(&storage_key, &owner).await {
            Ok(true) => {
                self.events.dispatch(Event::WriterReleased { key: storage_key, owner });
                Ok(true)
            }
            Ok(false) => {
                self.events.dispatch(Event::WriterFailedRelease { key: storage_key, owner });
                Ok(false)
            }
            Err(err) => self.unexpected("release_writer", Some(storage_key), err),
        }
    }

    pub async fn refresh_reader(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.refresh_reader(&storage_key, &owner, self.expiration()).await {
            Ok(true) => {
                self.events.dispatch(Event::ReaderRefreshed { key: storage_key, owner });
                Ok(true)
            }
            Ok(false) => {
                self.events.dispatch(Event::ReaderFailedRefresh { key: storage_key, owner });
                Ok(false)
            }
            Err(err) => self.unexpected("refresh_reader", Some(storage_key), err),
        }
    }

    pub async fn refresh_writer(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.refresh_writer(&storage_key, &owner, self.expiration()).await {
            Ok(true) => {
                self.events.dispatch(Event::WriterRefreshed { key: storage_key, owner });
                Ok(true)
            }
            Ok(false) => {
                self.events.dispatch(Event::WriterFailedRefresh { key: storage_key, owner });
                Ok(false)
            }
            Err(err) => self.unexpected("refresh_writer", Some(storage_key), err),
        }
    }

    pub async fn force_release_all_readers(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        match self.adapter.force_release_all_readers(&storage_key).await {
            Ok(had) => {
                self.events.dispatch(Event::ReaderAllForceReleased { key: storage_key, had });
                Ok(had)
            }
            Err(err) => self.unexpected("force_release_all_readers", Some(storage_key), err),
        }
    }

    pub async fn force_release_writer(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        match self.adapter.force_release_writer(&storage_key).await {
            Ok(had) => {
                self.events.dispatch(Event::WriterForceReleased { key: storage_key, had });
                Ok(had)
            }
            Err(err) => self.unexpected("force_release_writer", Some(storage_key), err),
        }
    }

    pub async fn force_release(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        match self.adapter.force_release(&storage_key).await {
            Ok(had) => Ok(had),
            Err(err) => self.unexpected("force_release", Some(storage_key), err),
        }
    }

    /// The calling handle's projection of the current row (§4.3.5).
    pub async fn get_state(&self) -> Result<SharedLockState> {
        let storage_key = self.storage_key();
        let row = match self.adapter.get_state(&storage_key).await {
            Ok(row) => row,
            Err(err) => return self.unexpected("get_state", Some(storage_key), err),
        };
        let now = Utc::now();
        Ok(match row {
            SharedLockRow::Absent => SharedLockState::Expired,
            SharedLockRow::Writer { owner, expiration } => {
                if owner == self.owner_string() {
                    SharedLockState::WriterAcquired {
                        remaining: expiration.map(|exp| exp - now),
                    }
                } else {
                    SharedLockState::WriterUnavailable { owner }
                }
            }
            SharedLockRow::Readers { limit, slots } => self.project_readers(limit, slots, now),
        })
    }

    fn project_readers(&self, limit: usize, slots: HashMap<String, Option<DateTime<Utc>>>, now: DateTime<Utc>) -> SharedLockState {
        let owner = self.owner_string();
        if let Some(expiration) = slots.get(&owner) {
            SharedLockState::ReaderAcquired {
                limit,
                owner_slots: slots.len(),
                remaining: expiration.map(|exp| exp - now),
            }
        } else if slots.len() < limit {
            SharedLockState::ReaderUnacquired {
                limit,
                free_slots: limit - slots.len(),
                acquired_slot_count: slots.len(),
            }
        } else {
            SharedLockState::ReaderLimitReached {
                limit,
                acquired_owners: slots.into_keys().collect(),
            }
        }
    }

    fn unexpected<T>(&self, method: &'static str, key: Option<String>, err: Error) -> Result<T> {
        log::error!("unexpected error in shared_lock::{method}: {err}");
        self.events.dispatch(Event::UnexpectedError {
            key,
            method,
            error: err.to_string(),
        });
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemorySharedLockAdapter;
    use crate::key::Namespace;

    fn shared_lock(adapter: Arc<dyn SharedLockAdapter>, events: Arc<EventBus>, limit: usize) -> SharedLock {
        let ns = Namespace::new("test");
        SharedLock::new(ns.create(["shared-a"]), limit, None, adapter, events)
    }

    #[tokio::test]
    async fn writer_excludes_readers_until_released() {
        let adapter: Arc<dyn SharedLockAdapter> = Arc::new(MemorySharedLockAdapter::new());
        let events = Arc::new(EventBus::default());
        let writer = shared_lock(adapter.clone(), events.clone(), 2);
        let reader = shared_lock(adapter, events, 2);

        assert!(writer.acquire_writer().await.unwrap());
        assert!(!reader.acquire_reader().await.unwrap());
        assert_eq!(reader.get_state().await.unwrap(), SharedLockState::WriterUnavailable { owner: writer.owner_string() });

        assert!(writer.release_writer().await.unwrap());
        assert!(reader.acquire_reader().await.unwrap());
    }

    #[tokio::test]
    async fn reader_limit_is_enforced_and_reentrant() {
        let adapter: Arc<dyn SharedLockAdapter> = Arc::new(MemorySharedLockAdapter::new());
        let events = Arc::new(EventBus::default());
        let r1 = shared_lock(adapter.clone(), events.clone(), 1);
        let r2 = shared_lock(adapter, events, 1);

        assert!(r1.acquire_reader().await.unwrap());
        assert!(r1.acquire_reader().await.unwrap()); // re-entrant
        assert!(!r2.acquire_reader().await.unwrap());

        match r2.get_state().await.unwrap() {
            SharedLockState::ReaderLimitReached { limit, .. } => assert_eq!(limit, 1),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn writer_can_take_over_after_all_readers_release() {
        let adapter: Arc<dyn SharedLockAdapter> = Arc::new(MemorySharedLockAdapter::new());
        let events = Arc::new(EventBus::default());
        let reader = shared_lock(adapter.clone(), events.clone(), 2);
        let writer = shared_lock(adapter, events, 2);

        assert!(reader.acquire_reader().await.unwrap());
        assert!(!writer.acquire_writer().await.unwrap());
        assert!(reader.release_reader().await.unwrap());
        assert!(writer.acquire_writer().await.unwrap());
    }
}
