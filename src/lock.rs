//! Distributed mutex (component C4)
//!
//! A state-machine wrapper around a [`LockAdapter`]: `Unlocked` /
//! `Held(owner, expires_at)` / `Expired` (logically `Unlocked`). Every
//! transition is one adapter call, so the adapter — not this module —
//! owns the atomicity; `Lock` only turns `bool`/`Option` adapter results
//! into typed outcomes and [`Event`]s, the same division of labor the
//! teacher's `DistributedMutex` draws between itself and its `DashMap`.

use crate::adapter::LockAdapter;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::key::Key;
use chrono::{Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A handle to one named lock. Cheap to clone; `owner_id` is fixed at
/// construction and never reused, so two `Lock` handles for the same key
/// are different owners unless built with [`Lock::with_owner_id`] (used
/// by the serde transformer to reconstruct a handle across processes).
#[derive(Clone)]
pub struct Lock {
    key: Key,
    owner_id: Uuid,
    ttl: Option<ChronoDuration>,
    default_blocking_time: Duration,
    default_blocking_interval: Duration,
    adapter: Arc<dyn LockAdapter>,
    events: Arc<EventBus>,
}

impl Lock {
    /// Build a handle with a freshly generated owner ID.
    pub fn new(
        key: Key,
        ttl: Option<ChronoDuration>,
        adapter: Arc<dyn LockAdapter>,
        events: Arc<EventBus>,
        default_blocking_time: Duration,
        default_blocking_interval: Duration,
    ) -> Self {
        Self {
            key,
            owner_id: Uuid::new_v4(),
            ttl,
            default_blocking_time,
            default_blocking_interval,
            adapter,
            events,
        }
    }

    /// Build a handle with an explicit owner ID, used when a serialized
    /// handle is reconstructed in another process (§4.7).
    pub fn with_owner_id(
        key: Key,
        owner_id: Uuid,
        ttl: Option<ChronoDuration>,
        adapter: Arc<dyn LockAdapter>,
        events: Arc<EventBus>,
        default_blocking_time: Duration,
        default_blocking_interval: Duration,
    ) -> Self {
        Self {
            key,
            owner_id,
            ttl,
            default_blocking_time,
            default_blocking_interval,
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

    fn expiration(&self) -> Option<chrono::DateTime<Utc>> {
        self.ttl.map(|d| Utc::now() + d)
    }

    /// Non-blocking acquire. Returns whether the lock was obtained.
    pub async fn acquire(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.insert(&storage_key, &owner, self.expiration()).await {
            Ok(true) => {
                log::debug!("lock {storage_key} acquired by {owner}");
                self.events.dispatch(Event::Acquired {
                    key: storage_key,
                    owner,
                });
                Ok(true)
            }
            Ok(false) => {
                log::debug!("lock {storage_key} contended, owner {owner} denied");
                self.events.dispatch(Event::FailedAcquire {
                    key: storage_key,
                    owner,
                });
                Ok(false)
            }
            Err(err) => self.unexpected("acquire", Some(storage_key), err),
        }
    }

    /// `acquire`, failing with [`Error::FailedAcquire`] instead of
    /// returning `false`.
    pub async fn acquire_or_fail(&self) -> Result<()> {
        if self.acquire().await? {
            Ok(())
        } else {
            Err(Error::FailedAcquire(self.storage_key()))
        }
    }

    /// Poll `acquire` every `interval` until `time` elapses or it
    /// succeeds. `time = Duration::ZERO` behaves like non-blocking
    /// `acquire`. Cooperatively cancellable: cancel the returned future
    /// (e.g. via `tokio::select!`) to stop promptly at the next sleep
    /// boundary.
    pub async fn acquire_blocking(&self, time: Option<Duration>, interval: Option<Duration>) -> Result<bool> {
        let time = time.unwrap_or(self.default_blocking_time);
        let interval = interval.unwrap_or(self.default_blocking_interval);
        let deadline = tokio::time::Instant::now() + time;

        loop {
            if self.acquire().await? {
                return Ok(true);
            }
            if time.is_zero() || tokio::time::Instant::now() >= deadline {
                let storage_key = self.storage_key();
                let owner = self.owner_string();
                log::debug!("lock {storage_key} blocking acquire gave up for owner {owner}");
                self.events.dispatch(Event::Unavailable { key: storage_key, owner });
                return Ok(false);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Release, conditional on this handle being the current owner.
    pub async fn release(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.remove(&storage_key, Some(&owner)).await {
            Ok(true) => {
                log::debug!("lock {storage_key} released by {owner}");
                self.events.dispatch(Event::Released {
                    key: storage_key,
                    owner,
                });
                Ok(true)
            }
            Ok(false) => {
                log::debug!("lock {storage_key} release denied: {owner} is not the owner");
                self.events.dispatch(Event::FailedRelease {
                    key: storage_key,
                    owner,
                });
                Ok(false)
            }
            Err(err) => self.unexpected("release", Some(storage_key), err),
        }
    }

    pub async fn release_or_fail(&self) -> Result<()> {
        if self.release().await? {
            Ok(())
        } else {
            Err(Error::FailedRelease(self.storage_key()))
        }
    }

    /// Unconditional delete, regardless of current owner. Always
    /// succeeds; `had` reflects whether anything was actually deleted.
    pub async fn force_release(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        match self.adapter.remove(&storage_key, None).await {
            Ok(had) => {
                log::warn!("lock {storage_key} force-released (had={had})");
                self.events.dispatch(Event::ForceReleased { key: storage_key, had });
                Ok(had)
            }
            Err(err) => self.unexpected("force_release", Some(storage_key), err),
        }
    }

    /// Extend this handle's expiration without releasing, conditional on
    /// ownership.
    pub async fn refresh(&self) -> Result<bool> {
        let storage_key = self.storage_key();
        let owner = self.owner_string();
        match self.adapter.refresh(&storage_key, &owner, self.expiration()).await {
            Ok(true) => {
                self.events.dispatch(Event::Refreshed {
                    key: storage_key,
                    owner,
                });
                Ok(true)
            }
            Ok(false) => {
                self.events.dispatch(Event::FailedRefresh {
                    key: storage_key,
                    owner,
                });
                Ok(false)
            }
            Err(err) => self.unexpected("refresh", Some(storage_key), err),
        }
    }

    pub async fn refresh_or_fail(&self) -> Result<()> {
        if self.refresh().await? {
            Ok(())
        } else {
            Err(Error::FailedRefresh(self.storage_key()))
        }
    }

    /// Whether the lock is currently held by anyone (by this handle or
    /// another).
    pub async fn is_locked(&self) -> Result<bool> {
        match self.adapter.find(&self.storage_key()).await {
            Ok(row) => Ok(row.is_some()),
            Err(err) => self.unexpected("is_locked", Some(self.storage_key()), err),
        }
    }

    /// `acquire; run body; release`, unconditionally releasing even if
    /// `body` errors. The body's error always wins; a release failure
    /// that occurs while unwinding a body error is only surfaced as an
    /// `UnexpectedError` event, never returned.
    pub async fn run<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_or_fail().await?;
        let result = body().await;
        if let Err(release_err) = self.release().await {
            log::warn!("lock {} release failed while running body: {release_err}", self.storage_key());
            self.events.dispatch(Event::UnexpectedError {
                key: Some(self.storage_key()),
                method: "run",
                error: release_err.to_string(),
            });
        }
        result
    }

    fn unexpected<T>(&self, method: &'static str, key: Option<String>, err: Error) -> Result<T> {
        log::error!("unexpected error in lock::{method}: {err}");
        self.events.dispatch(Event::UnexpectedError {
            key,
            method,
            error: err.to_string(),
        });
        Err(err)
    }
}
