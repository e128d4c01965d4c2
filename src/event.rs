//! Event dispatch contract (component C6)
//!
//! A minimal pub/sub surface the cache, lock, and shared-lock cores publish
//! to. Delivery is at-most-once within a single process and order-preserving
//! per kind per subscriber; cross-process delivery is an adapter concern and
//! out of scope here. Built on [`tokio::sync::broadcast`], the same
//! primitive the teacher's invalidation pub/sub uses.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tokio::sync::broadcast;

/// Why a shared-lock reader acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderFailureReason {
    /// A writer currently holds the key.
    WriterPresent,
    /// The reader slot table for this key is full.
    LimitReached,
}

/// One externally visible state transition of a cache, lock, or shared-lock
/// operation. Emitted *after* the adapter has confirmed the state change;
/// emission itself is best-effort and never rolls back core state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // --- Cache events ---
    /// `get` found a live value.
    KeyFound { key: String },
    /// `get` found no live value (absent or expired).
    KeyNotFound { key: String },
    /// `add` inserted a previously-absent key.
    KeyAdded { key: String },
    /// `update` or `put` replaced an existing key's value.
    KeyUpdated { key: String },
    /// `remove` or `get_and_remove` deleted a key.
    KeyRemoved { key: String },
    /// `increment`/`decrement` succeeded with a positive delta.
    KeyIncremented { key: String, delta: i64 },
    /// `increment`/`decrement` succeeded with a negative delta.
    KeyDecremented { key: String, delta: i64 },
    /// `clear` removed every key under a namespace prefix.
    KeysCleared { namespace: String },

    // --- Lock events ---
    /// `acquire` succeeded.
    Acquired { key: String, owner: String },
    /// `acquire` failed because another owner held the lock.
    FailedAcquire { key: String, owner: String },
    /// `release` succeeded.
    Released { key: String, owner: String },
    /// `release` failed because the caller was not the owner.
    FailedRelease { key: String, owner: String },
    /// `force_release` ran; `had` is whether a lock was actually present.
    ForceReleased { key: String, had: bool },
    /// `refresh` succeeded.
    Refreshed { key: String, owner: String },
    /// `refresh` failed because the caller was not the owner.
    FailedRefresh { key: String, owner: String },
    /// A blocking acquire loop gave up without ever succeeding.
    Unavailable { key: String, owner: String },

    // --- Shared-lock events (writer mirror set) ---
    ReaderAcquired { key: String, owner: String },
    ReaderFailedAcquire {
        key: String,
        owner: String,
        reason: ReaderFailureReason,
    },
    ReaderReleased { key: String, owner: String },
    ReaderFailedRelease { key: String, owner: String },
    ReaderRefreshed { key: String, owner: String },
    ReaderFailedRefresh { key: String, owner: String },
    ReaderAllForceReleased { key: String, had: bool },

    WriterAcquired { key: String, owner: String },
    WriterFailedAcquire { key: String, owner: String },
    WriterReleased { key: String, owner: String },
    WriterFailedRelease { key: String, owner: String },
    WriterRefreshed { key: String, owner: String },
    WriterFailedRefresh { key: String, owner: String },
    WriterForceReleased { key: String, had: bool },

    /// An adapter failure the core could not classify.
    UnexpectedError {
        key: Option<String>,
        method: &'static str,
        error: String,
    },
}

impl Event {
    /// A stable tag for this event's kind, for subscribers that want to
    /// filter by kind without matching the full payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::KeyFound { .. } => "key_found",
            Event::KeyNotFound { .. } => "key_not_found",
            Event::KeyAdded { .. } => "key_added",
            Event::KeyUpdated { .. } => "key_updated",
            Event::KeyRemoved { .. } => "key_removed",
            Event::KeyIncremented { .. } => "key_incremented",
            Event::KeyDecremented { .. } => "key_decremented",
            Event::KeysCleared { .. } => "keys_cleared",
            Event::Acquired { .. } => "acquired",
            Event::FailedAcquire { .. } => "failed_acquire",
            Event::Released { .. } => "released",
            Event::FailedRelease { .. } => "failed_release",
            Event::ForceReleased { .. } => "force_released",
            Event::Refreshed { .. } => "refreshed",
            Event::FailedRefresh { .. } => "failed_refresh",
            Event::Unavailable { .. } => "unavailable",
            Event::ReaderAcquired { .. } => "reader_acquired",
            Event::ReaderFailedAcquire { .. } => "reader_failed_acquire",
            Event::ReaderReleased { .. } => "reader_released",
            Event::ReaderFailedRelease { .. } => "reader_failed_release",
            Event::ReaderRefreshed { .. } => "reader_refreshed",
            Event::ReaderFailedRefresh { .. } => "reader_failed_refresh",
            Event::ReaderAllForceReleased { .. } => "reader_all_force_released",
            Event::WriterAcquired { .. } => "writer_acquired",
            Event::WriterFailedAcquire { .. } => "writer_failed_acquire",
            Event::WriterReleased { .. } => "writer_released",
            Event::WriterFailedRelease { .. } => "writer_failed_release",
            Event::WriterRefreshed { .. } => "writer_refreshed",
            Event::WriterFailedRefresh { .. } => "writer_failed_refresh",
            Event::WriterForceReleased { .. } => "writer_force_released",
            Event::UnexpectedError { .. } => "unexpected_error",
        }
    }
}

/// Fire-and-forget pub/sub channel shared by a `Provider`'s `Cache`,
/// `Lock`, and `SharedLock` handles.
///
/// `dispatch` never blocks on subscribers and never surfaces a
/// subscriber's failure to the caller — there is nothing to surface, since
/// `broadcast::Sender::send` only fails when there are no receivers, which
/// is not an error condition for a fire-and-forget bus.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity (number of events
    /// a lagging subscriber may fall behind by before being dropped).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Fire-and-forget: returns immediately regardless of
    /// whether any subscriber is currently listening.
    pub fn dispatch(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events. Callers filter by [`Event::kind`] /
    /// pattern-match themselves; there is no server-side kind filter since
    /// `broadcast` fans every message out to every receiver regardless.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Register `callback` against every future event whose [`Event::kind`]
    /// equals `kind`, spawning one task to drain the broadcast stream on
    /// its behalf. Dropping the returned [`UnsubscribeGuard`] stops
    /// delivery; it is this listener's unsubscribe handle.
    pub fn add_listener<F>(&self, kind: &str, callback: F) -> UnsubscribeGuard
    where
        F: Fn(Event) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let kind = kind.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => callback(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        UnsubscribeGuard { handle }
    }

    /// Like [`EventBus::add_listener`], but invokes `callback` at most
    /// once, for the first future event whose kind matches, then stops
    /// listening on its own.
    pub fn listen_once<F>(&self, kind: &str, callback: F)
    where
        F: FnOnce(Event) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let kind = kind.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => {
                        callback(event);
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Unsubscribe handle for [`EventBus::add_listener`]. Aborts the
/// listener's background task on drop; there is no separate
/// `unsubscribe()` method since dropping the guard *is* unsubscribing.
pub struct UnsubscribeGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_is_fire_and_forget_with_no_subscribers() {
        let bus = EventBus::default();
        bus.dispatch(Event::KeyAdded { key: "a".into() });
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.dispatch(Event::KeyAdded { key: "a".into() });
        bus.dispatch(Event::KeyRemoved { key: "a".into() });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "key_added");
        assert_eq!(second.kind(), "key_removed");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_see_every_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.dispatch(Event::Acquired {
            key: "a".into(),
            owner: "o1".into(),
        });

        assert_eq!(rx1.recv().await.unwrap().kind(), "acquired");
        assert_eq!(rx2.recv().await.unwrap().kind(), "acquired");
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn add_listener_only_fires_for_matching_kind() {
        let bus = EventBus::default();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _guard = bus.add_listener("key_added", move |event| {
            seen_clone.lock().unwrap().push(event.kind());
        });

        bus.dispatch(Event::KeyRemoved { key: "a".into() });
        bus.dispatch(Event::KeyAdded { key: "a".into() });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["key_added"]);
    }

    #[tokio::test]
    async fn dropping_unsubscribe_guard_stops_delivery() {
        let bus = EventBus::default();
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let guard = bus.add_listener("key_added", move |_| {
            seen_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        bus.dispatch(Event::KeyAdded { key: "a".into() });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);

        drop(guard);
        bus.dispatch(Event::KeyAdded { key: "a".into() });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listen_once_fires_only_for_the_first_match() {
        let bus = EventBus::default();
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen_clone = seen.clone();
        bus.listen_once("key_added", move |_| {
            seen_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        bus.dispatch(Event::KeyAdded { key: "a".into() });
        bus.dispatch(Event::KeyAdded { key: "b".into() });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
