//! Crate-wide error taxonomy
//!
//! Every fallible core and adapter operation returns [`Result<T>`], wrapping
//! the [`Error`] enum below. Adapters convert their own transport errors
//! (`sqlx::Error`, `redis::RedisError`, `std::io::Error`) into this type via
//! `#[from]` rather than exposing their driver's error type at the core
//! boundary.

use thiserror::Error;

/// Errors produced by the cache, lock, and shared-lock cores and their
/// storage adapters.
#[derive(Error, Debug)]
pub enum Error {
    /// Raised only by `get_or_fail` and the `*_or_fail` release/refresh
    /// variants when the targeted key/lock does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A numeric cache operation (`increment`/`decrement`) was attempted on
    /// a value that does not parse as a signed integer.
    #[error("type mismatch: value at key {0} is not numeric")]
    TypeMismatch(String),

    /// A shared lock's writer slot is held by someone else.
    #[error("lock unavailable: {0}")]
    Unavailable(String),

    /// A shared lock's reader limit has been reached.
    #[error("reader limit reached for key {0} (limit {1})")]
    LimitReached(String, usize),

    /// The `_or_fail` variant of `acquire` failed to obtain the lock.
    #[error("failed to acquire lock: {0}")]
    FailedAcquire(String),

    /// The `_or_fail` variant of `release` was called by a non-owner.
    #[error("failed to release lock: {0}")]
    FailedRelease(String),

    /// The `_or_fail` variant of `refresh` was called by a non-owner.
    #[error("failed to refresh lock: {0}")]
    FailedRefresh(String),

    /// A `Provider` was configured with an adapter name that has no
    /// registered driver.
    #[error("unregistered driver: {0}")]
    UnregisteredDriver(String),

    /// A `Provider` was constructed without a default driver and none was
    /// specified at the call site.
    #[error("no default driver defined")]
    DefaultDriverNotDefined,

    /// An adapter failure the core could not classify into one of the
    /// kinds above. Always raised *and* emitted as an `UnexpectedError`
    /// event (see [`crate::event`]).
    #[error("unexpected error in {method}: {source}")]
    Unexpected {
        /// The operation that failed.
        method: &'static str,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// Error surfaced by the SQL reference adapter.
    #[error("sql adapter error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Error surfaced by the Redis reference adapter.
    #[error("redis adapter error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Error surfaced when (de)serializing a cache value or a serde
    /// transformer record.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from an adapter's underlying backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap an arbitrary error as [`Error::Unexpected`], tagging it with the
    /// method name that produced it. Used by adapters whose failure cannot
    /// be classified into a more specific variant.
    pub fn unexpected(method: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Error::Unexpected {
            method,
            source: source.into(),
        }
    }

    /// Whether a transient-failure retry policy (see [`crate::retry`])
    /// should ever retry this error. `TypeMismatch`, `KeyNotFound`, and
    /// `UnregisteredDriver` are logical failures, never transport blips,
    /// and are excluded unconditionally.
    pub fn is_retryable_candidate(&self) -> bool {
        !matches!(
            self,
            Error::TypeMismatch(_) | Error::KeyNotFound(_) | Error::UnregisteredDriver(_)
        )
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_candidates_exclude_logical_failures() {
        assert!(!Error::TypeMismatch("a".into()).is_retryable_candidate());
        assert!(!Error::KeyNotFound("a".into()).is_retryable_candidate());
        assert!(!Error::UnregisteredDriver("a".into()).is_retryable_candidate());
        assert!(Error::Unavailable("a".into()).is_retryable_candidate());
        assert!(Error::unexpected("test", anyhow::anyhow!("boom")).is_retryable_candidate());
    }
}
