//! Transient-error retry policy (component C10)
//!
//! Wraps adapter calls that can fail transiently (network blip, SQL
//! serialization failure) with a configurable retry loop. Mirrors the
//! teacher's `TransactionManager::transaction_with_retry` backoff-and-retry
//! shape, generalized to any fallible adapter call.
//!
//! Retry is strictly for adapter-transport failures: a logical `false`
//! return from a contended `acquire` is never retried by this policy, and
//! `Error::TypeMismatch` / `Error::KeyNotFound` / `Error::UnregisteredDriver`
//! are excluded unconditionally regardless of the predicate supplied.

use crate::error::Error;
use std::future::Future;
use std::time::Duration;

/// A backoff function from attempt number (1-based) to a sleep duration.
pub type BackoffPolicy = std::sync::Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff starting at `base`, doubling each attempt, capped at
/// `max`.
pub fn exponential_backoff(base: Duration, max: Duration) -> BackoffPolicy {
    std::sync::Arc::new(move |attempt: u32| {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(max)
    })
}

/// Fixed-interval backoff, matching the teacher's flat retry delay.
pub fn fixed_backoff(interval: Duration) -> BackoffPolicy {
    std::sync::Arc::new(move |_attempt: u32| interval)
}

/// Retry policy applied to adapter calls at the provider level.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl RetryPolicy {
    /// Construct a retry policy with the given attempt cap and backoff
    /// function.
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A policy that never retries: one attempt, then surface the error.
    pub fn none() -> Self {
        Self::new(1, fixed_backoff(Duration::ZERO))
    }

    /// Run `op` under this policy. `op` is invoked at least once; it is
    /// retried only while it returns an error for which
    /// [`Error::is_retryable_candidate`] is true and the attempt count is
    /// under `max_attempts`.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && err.is_retryable_candidate() => {
                    log::warn!(
                        "transient error on attempt {attempt}/{}: {err}, retrying",
                        self.max_attempts
                    );
                    tokio::time::sleep((self.backoff)(attempt)).await;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, exponential_backoff(Duration::from_millis(10), Duration::from_secs(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success_within_attempt_cap() {
        let policy = RetryPolicy::new(3, fixed_backoff(Duration::from_millis(1)));
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::Unavailable("retry me".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_type_mismatch() {
        let policy = RetryPolicy::new(5, fixed_backoff(Duration::from_millis(1)));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), Error> = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TypeMismatch("k".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = exponential_backoff(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(2), Duration::from_millis(20));
        assert_eq!(backoff(3), Duration::from_millis(35)); // would be 40, capped
    }
}
