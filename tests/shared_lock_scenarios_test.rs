//! Shared-lock scenarios (SPEC_FULL §8: S5, S6, invariants 4/5), run
//! against every reference adapter with the same assertions.

mod support;

use latch::adapter::SharedLockAdapter;
use latch::event::EventBus;
use latch::key::Namespace;
use latch::{SharedLock, SharedLockState};
use std::sync::Arc;

fn handle(adapter: Arc<dyn SharedLockAdapter>, limit: usize) -> SharedLock {
    SharedLock::new(Namespace::new("scenario").create(["doc"]), limit, None, adapter, Arc::new(EventBus::default()))
}

fn sibling(lock: &SharedLock, adapter: Arc<dyn SharedLockAdapter>, limit: usize) -> SharedLock {
    SharedLock::new(lock.key().clone(), limit, None, adapter, Arc::new(EventBus::default()))
}

/// S5: a writer excludes readers; once released, up to `limit` readers may
/// acquire and a reader past the limit is refused with `ReaderLimitReached`.
async fn writer_blocks_readers(adapter: Arc<dyn SharedLockAdapter>) {
    let writer = handle(adapter.clone(), 2);
    let r1 = sibling(&writer, adapter.clone(), 2);
    let r2 = sibling(&writer, adapter.clone(), 2);
    let r3 = sibling(&writer, adapter, 2);

    assert!(writer.acquire_writer().await.unwrap());
    assert!(!r1.acquire_reader().await.unwrap());
    assert!(writer.release_writer().await.unwrap());

    assert!(r1.acquire_reader().await.unwrap());
    assert!(r2.acquire_reader().await.unwrap());
    assert!(!r3.acquire_reader().await.unwrap());
    match r3.get_state().await.unwrap() {
        SharedLockState::ReaderLimitReached { limit, .. } => assert_eq!(limit, 2),
        other => panic!("unexpected state: {other:?}"),
    }
}

/// S6: refresh by a non-owner is denied and does not disturb the owner's
/// slot.
async fn refresh_denied_for_non_owner(adapter: Arc<dyn SharedLockAdapter>) {
    let r1 = handle(adapter.clone(), 2);
    let r2 = sibling(&r1, adapter, 2);

    assert!(r1.acquire_reader().await.unwrap());
    assert!(!r2.refresh_reader().await.unwrap());
    match r1.get_state().await.unwrap() {
        SharedLockState::ReaderAcquired { owner_slots, .. } => assert_eq!(owner_slots, 1),
        other => panic!("unexpected state: {other:?}"),
    }
}

/// Invariant 4: at any instant, at most one of (writer present, >=1 reader
/// present) holds for a key.
async fn writer_and_readers_are_mutually_exclusive(adapter: Arc<dyn SharedLockAdapter>) {
    let reader = handle(adapter.clone(), 3);
    let writer = sibling(&reader, adapter, 3);

    assert!(reader.acquire_reader().await.unwrap());
    assert!(!writer.acquire_writer().await.unwrap());
    assert!(reader.release_reader().await.unwrap());
    assert!(writer.acquire_writer().await.unwrap());
    assert!(!reader.acquire_reader().await.unwrap());
}

/// Invariant 5: `N > limit` distinct owners racing `acquire_reader`
/// produces at most `limit` successes.
async fn reader_limit_holds_under_concurrency(adapter: Arc<dyn SharedLockAdapter>) {
    let limit = 3;
    let anchor = handle(adapter.clone(), limit);
    let handles: Vec<SharedLock> = (0..10).map(|_| sibling(&anchor, adapter.clone(), limit)).collect();

    let mut tasks = Vec::new();
    for h in handles {
        tasks.push(tokio::spawn(async move { h.acquire_reader().await.unwrap() }));
    }
    let mut successes = 0;
    for task in tasks {
        if task.await.unwrap() {
            successes += 1;
        }
    }
    assert!(successes <= limit, "expected at most {limit} successes, got {successes}");
}

#[tokio::test]
async fn memory_writer_blocks_readers() {
    writer_blocks_readers(support::memory_shared_lock().await).await;
}

#[tokio::test]
async fn memory_refresh_denied_for_non_owner() {
    refresh_denied_for_non_owner(support::memory_shared_lock().await).await;
}

#[tokio::test]
async fn memory_writer_and_readers_are_mutually_exclusive() {
    writer_and_readers_are_mutually_exclusive(support::memory_shared_lock().await).await;
}

#[tokio::test]
async fn memory_reader_limit_holds_under_concurrency() {
    reader_limit_holds_under_concurrency(support::memory_shared_lock().await).await;
}

#[tokio::test]
async fn sql_writer_blocks_readers() {
    writer_blocks_readers(support::sql_shared_lock().await).await;
}

#[tokio::test]
async fn sql_refresh_denied_for_non_owner() {
    refresh_denied_for_non_owner(support::sql_shared_lock().await).await;
}

#[tokio::test]
async fn sql_writer_and_readers_are_mutually_exclusive() {
    writer_and_readers_are_mutually_exclusive(support::sql_shared_lock().await).await;
}

#[tokio::test]
async fn redis_writer_blocks_readers() {
    let Some(adapter) = support::redis_adapter().await else { return };
    writer_blocks_readers(adapter).await;
}

#[tokio::test]
async fn redis_refresh_denied_for_non_owner() {
    let Some(adapter) = support::redis_adapter().await else { return };
    refresh_denied_for_non_owner(adapter).await;
}
