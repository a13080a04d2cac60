//! Event infrastructure for the store and sync engine.
//!
//! The store emits `LocalChange` after every mutation; the sync engine emits
//! the remaining events. UI collaborators subscribe through `EventBus` and
//! hold the returned `Subscription` for as long as they want callbacks.

use crate::store::DatabaseSnapshot;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the document store and sync engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreEvent {
    /// A local mutation was applied to the store.
    LocalChange {
        /// Collection that was mutated.
        collection: String,
        /// Id of the mutated document.
        #[serde(rename = "docId")]
        doc_id: String,
    },
    /// A foreign-authored revision was applied over the local database.
    RemoteChange {
        /// Revision that was applied.
        #[serde(rename = "revisionId")]
        revision_id: String,
        /// Writer identity that published the revision.
        author: String,
        /// The database contents after application.
        snapshot: DatabaseSnapshot,
    },
    /// A fetch/apply cycle began.
    SyncStarted,
    /// A fetch/apply cycle finished (successfully or not).
    SyncFinished,
    /// A sync or persistence operation failed; the cycle was abandoned.
    SyncError {
        /// Human-readable failure description.
        message: String,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing store events to subscribers.
///
/// Thread-safe for use in a multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(StoreEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers, in subscription order.
    pub fn emit(&self, event: StoreEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn local_change(id: &str) -> StoreEvent {
        StoreEvent::LocalChange {
            collection: "students".into(),
            doc_id: id.into(),
        }
    }

    #[test]
    fn test_emit_reaches_subscribers_in_subscription_order() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let ui = Arc::clone(&seen);
        let _ui_sub = bus.subscribe(move |event| {
            if let StoreEvent::LocalChange { doc_id, .. } = event {
                ui.lock().unwrap().push(format!("ui:{doc_id}"));
            }
        });
        let logger = Arc::clone(&seen);
        let _log_sub = bus.subscribe(move |event| {
            if let StoreEvent::LocalChange { doc_id, .. } = event {
                logger.lock().unwrap().push(format!("log:{doc_id}"));
            }
        });

        bus.emit(local_change("s1"));
        bus.emit(local_change("s2"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["ui:s1", "log:s1", "ui:s2", "log:s2"]
        );
    }

    #[test]
    fn test_dropped_subscription_stops_mid_stream() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let keeper = Arc::clone(&seen);
        let _kept = bus.subscribe(move |event| {
            if let StoreEvent::LocalChange { doc_id, .. } = event {
                keeper.lock().unwrap().push(format!("kept:{doc_id}"));
            }
        });
        let leaver = Arc::clone(&seen);
        let short_lived = bus.subscribe(move |event| {
            if let StoreEvent::LocalChange { doc_id, .. } = event {
                leaver.lock().unwrap().push(format!("gone:{doc_id}"));
            }
        });

        bus.emit(local_change("a"));
        drop(short_lived);
        bus.emit(local_change("b"));

        // The surviving subscriber keeps receiving; the dropped one stops
        assert_eq!(*seen.lock().unwrap(), vec!["kept:a", "gone:a", "kept:b"]);
    }

    #[test]
    fn test_subscribe_from_within_a_callback() {
        // emit snapshots the callback list, so a callback may subscribe
        // without deadlocking; the new subscriber sees later emits only
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let held: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        let bus_clone = Arc::clone(&bus);
        let count_clone = Arc::clone(&count);
        let held_clone = Arc::clone(&held);
        let _sub = bus.subscribe(move |event| {
            if let StoreEvent::SyncStarted = event {
                let counter = Arc::clone(&count_clone);
                let late = bus_clone.subscribe(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                held_clone.lock().unwrap().push(late);
            }
        });

        bus.emit(StoreEvent::SyncStarted);
        assert_eq!(count.load(Ordering::Relaxed), 0);

        bus.emit(StoreEvent::SyncFinished);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&local_change("abc123")).unwrap();
        assert!(json.contains("\"type\":\"localChange\""));
        assert!(json.contains("\"collection\":\"students\""));
        assert!(json.contains("\"docId\":\"abc123\""));

        let remote = StoreEvent::RemoteChange {
            revision_id: "deadbeef".into(),
            author: "a@example.com".into(),
            snapshot: DatabaseSnapshot::default(),
        };
        let json = serde_json::to_string(&remote).unwrap();
        assert!(json.contains("\"type\":\"remoteChange\""));
        assert!(json.contains("\"revisionId\":\"deadbeef\""));
        assert!(json.contains("\"author\":\"a@example.com\""));
    }
}
