//! Storage adapter contracts (component C2)
//!
//! These traits are what the cache, lock, and shared-lock cores (§4.1–4.3)
//! require of a backing store; they say nothing about *how* a backend gets
//! there. [`CacheAdapter`] and [`LockAdapter`] describe operations the core
//! treats as atomic; the richer "Database*Adapter" wording from the
//! specification — `find` + a single serializable transaction per logical
//! op — is how [`sql::SqlCacheAdapter`] and friends satisfy these same
//! traits internally, not a separate trait the core programs against (see
//! `DESIGN.md` for the open-question resolution).
//!
//! For the shared lock, the atomic reader/writer transition algorithm of
//! §4.3.1–4.3.2 is implemented *inside* the adapter (each backend picks its
//! own atomicity mechanism); [`SharedLockAdapter`] exposes the already-
//! atomic primitives, and [`crate::shared_lock::SharedLock`] only turns
//! their results into typed outcomes, events, and the caller-perspective
//! [`SharedLockState`] projection.

pub mod memory;
pub mod redis;
pub mod sql;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A stored cache value plus its absolute expiration instant, or `None` if
/// it never expires. Logically absent once `expiration <= now` (§3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub value: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// A stored lock entry (§3.3). Logically absent once `expiration <= now`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub owner: String,
    pub expiration: Option<DateTime<Utc>>,
}

/// The raw shape of a shared-lock key (§3.4), as reported by the adapter.
/// [`crate::shared_lock::SharedLock::get_state`] turns this into a
/// caller-perspective projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedLockRow {
    /// No writer and no live reader slots.
    Absent,
    /// A writer shape, identical semantics to [`LockRow`].
    Writer { owner: String, expiration: Option<DateTime<Utc>> },
    /// A reader shape: a fixed `limit` and the currently held slots.
    Readers {
        limit: usize,
        slots: HashMap<String, Option<DateTime<Utc>>>,
    },
}

/// Optional lifecycle hooks for adapters that own background resources
/// (a SQL/Redis sweeper task). Double-init and double-de-init must be
/// no-ops (§5).
#[async_trait]
pub trait AdapterLifecycle: Send + Sync {
    /// Bootstrap schema/connections and start the sweeper, if any.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Stop the sweeper and release resources, if any.
    async fn de_init(&self) -> Result<()> {
        Ok(())
    }
}

/// What the cache core (§4.1) requires of a backing store. Every method is
/// expected to be atomic with respect to concurrent callers on the same
/// key; TTL interpretation is server-side where possible, or emulated by
/// the adapter reading-and-comparing `expiration` against "now" as
/// described in §4.1's TTL policy.
#[async_trait]
pub trait CacheAdapter: AdapterLifecycle {
    /// Stable tag identifying this adapter's concrete type, used by the
    /// serde transformer registry (§4.7) and independent of the Rust type
    /// name.
    fn type_tag(&self) -> &'static str;

    /// Read a live value, or `None` if absent/expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically read and delete a live value.
    async fn get_and_remove(&self, key: &str) -> Result<Option<String>>;

    /// Insert `value` only if `key` is currently absent (or expired).
    /// Returns whether the insert happened.
    async fn add(&self, key: &str, value: &str, ttl: Option<chrono::Duration>) -> Result<bool>;

    /// Upsert `value`, resetting its TTL. Returns whether a live value was
    /// replaced (`false` means the key was freshly inserted).
    async fn put(&self, key: &str, value: &str, ttl: Option<chrono::Duration>) -> Result<bool>;

    /// Replace the value of an existing, live key without touching its
    /// TTL policy (conventionally resets TTL, see `Cache::update`).
    /// Returns whether the key existed.
    async fn update(&self, key: &str, value: &str) -> Result<bool>;

    /// Atomically add `delta` to the numeric value stored at `key`.
    /// Returns whether the key existed. Fails with `TypeMismatch` if the
    /// stored value does not parse as `i64`.
    async fn increment(&self, key: &str, delta: i64) -> Result<bool>;

    /// Delete a key. Returns whether it existed (and was live).
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Batch `remove`; returns which keys actually existed.
    async fn remove_many(&self, keys: &[String]) -> Result<HashMap<String, bool>>;

    /// Delete every key under the given storage-key prefix.
    async fn remove_by_key_prefix(&self, prefix: &str) -> Result<u64>;

    /// Delete every key this adapter holds.
    async fn remove_all(&self) -> Result<u64>;

    /// For SQL-like adapters that cannot atomically expire rows: delete all
    /// rows whose `expiration` has passed. In-memory/Redis adapters that
    /// expire natively may implement this as a no-op returning `0`.
    async fn remove_all_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

/// What the lock core (§4.2) requires of a backing store. Table from §6.1:
/// `insert`, `update` (succeeds only if currently expired), `remove`,
/// `refresh`, `find` — the same five operations regardless of whether the
/// concrete backend is in-memory, Redis, or SQL.
#[async_trait]
pub trait LockAdapter: AdapterLifecycle {
    /// Stable tag for the serde transformer registry (§4.7).
    fn type_tag(&self) -> &'static str;

    /// Insert a new lock row if `key` is absent or expired. Returns whether
    /// the insert happened.
    async fn insert(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool>;

    /// Overwrite an *expired* row with a new owner/expiration. Returns
    /// whether a row was updated (i.e. the prior row existed and was
    /// expired).
    async fn update(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool>;

    /// Delete the row at `key`. If `owner` is `Some`, only deletes when the
    /// current owner matches (a conditional `release`); if `None`, deletes
    /// unconditionally (`force_release`). Returns whether a row was
    /// deleted.
    async fn remove(&self, key: &str, owner: Option<&str>) -> Result<bool>;

    /// Update the expiration of the row owned by `owner`. Returns whether
    /// the row existed and was owned by `owner`.
    async fn refresh(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool>;

    /// Read the current row, or `None` if absent/expired.
    async fn find(&self, key: &str) -> Result<Option<LockRow>>;
}

/// What the shared-lock core (§4.3) requires of a backing store. Every
/// `acquire_*`/`release_*`/`refresh_*` method is the *entire* atomic
/// transaction described in §4.3.1–4.3.4, implemented by the adapter.
#[async_trait]
pub trait SharedLockAdapter: AdapterLifecycle {
    /// Stable tag for the serde transformer registry (§4.7).
    fn type_tag(&self) -> &'static str;

    /// §4.3.1: acquire (or re-enter) a reader slot. `limit` is only
    /// honored on first acquisition for this key; later callers' `limit`
    /// argument is ignored once a row exists.
    async fn acquire_reader(
        &self,
        key: &str,
        owner: &str,
        limit: usize,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// §4.3.2: acquire (or refresh, if same owner) the writer slot.
    async fn acquire_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool>;

    /// §4.3.3: release one reader slot. Returns whether a slot was removed.
    async fn release_reader(&self, key: &str, owner: &str) -> Result<bool>;

    /// §4.3.3: release the writer slot iff owned by `owner`.
    async fn release_writer(&self, key: &str, owner: &str) -> Result<bool>;

    /// §4.3.4: refresh a reader slot's expiration; only the owner may.
    async fn refresh_reader(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool>;

    /// §4.3.4: refresh the writer's expiration; only the owner may.
    async fn refresh_writer(&self, key: &str, owner: &str, expiration: Option<DateTime<Utc>>) -> Result<bool>;

    /// Unconditionally drop every reader slot for `key`. Returns whether
    /// any slot existed.
    async fn force_release_all_readers(&self, key: &str) -> Result<bool>;

    /// Unconditionally drop the writer slot for `key`. Returns whether it
    /// existed.
    async fn force_release_writer(&self, key: &str) -> Result<bool>;

    /// Unconditionally drop whichever shape `key` is in. Returns whether
    /// anything existed.
    async fn force_release(&self, key: &str) -> Result<bool>;

    /// §4.3.5: the raw current shape, expired entries already dropped.
    async fn get_state(&self, key: &str) -> Result<SharedLockRow>;
}
