//! # latch - distributed coordination toolkit
//!
//! A TTL-aware cache, a distributed mutex, a shared reader/writer lock, and
//! an in-process event bus, all backed by a pluggable adapter so the same
//! call sites work against an in-memory store, SQLite, or Redis.
//!
//! ## Architecture
//!
//! - `key`: hierarchical namespacing shared by every primitive
//! - `adapter`: the storage contracts (`CacheAdapter`, `LockAdapter`,
//!   `SharedLockAdapter`) plus the `memory`/`sql`/`redis` reference
//!   implementations
//! - `cache`: the TTL-aware cache core
//! - `lock`: the distributed mutex core
//! - `shared_lock`: the shared reader/writer lock core
//! - `event`: the fire-and-forget pub/sub bus cores dispatch to
//! - `retry`: transient-failure backoff wrapping adapter calls
//! - `serde_transformer`: cross-process (de)serialization of lock handles
//! - `provider`: the composition root wiring adapters, the event bus, and
//!   timing defaults into namespaced handles
//!
//! ## Quick start
//!
//! ```no_run
//! use latch::adapter::memory::{MemoryCacheAdapter, MemoryLockAdapter, MemorySharedLockAdapter};
//! use latch::provider::{Provider, ProviderConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> latch::error::Result<()> {
//! let provider = Provider::builder(ProviderConfig::default())
//!     .cache_adapter(Arc::new(MemoryCacheAdapter::new()))
//!     .lock_adapter(Arc::new(MemoryLockAdapter::new()))
//!     .shared_lock_adapter(Arc::new(MemorySharedLockAdapter::new()))
//!     .build()
//!     .await?;
//!
//! let cache = provider.cache("sessions")?;
//! cache.add("user-42", &"alice", None).await?;
//!
//! let lock = provider.lock("jobs", "nightly-export")?;
//! lock.run(|| async { Ok(()) }).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod cache;
pub mod error;
pub mod event;
pub mod key;
pub mod lock;
pub mod provider;
pub mod retry;
pub mod serde_transformer;
pub mod shared_lock;

pub use cache::Cache;
pub use error::{Error, Result};
pub use event::{Event, EventBus};
pub use key::{Key, Namespace};
pub use lock::Lock;
pub use provider::{Provider, ProviderConfig};
pub use shared_lock::{SharedLock, SharedLockState};

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
