//! Callback registry for session and presence event subscriptions.
//!
//! This module provides a thread-safe registry for managing event callbacks.
//! Sessions use it to report lifecycle changes ([`SessionEvent`]) to the UI
//! layer, and the presence channel uses it for peer updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::config::ConfigUpdate;

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type for events of type `E`.
///
/// Callbacks receive a reference to the event and should not block for extended periods.
pub type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Lifecycle notifications emitted by a [`ReplicatedDocumentSession`](crate::crdt::ReplicatedDocumentSession).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Collaboration started for the room.
    Started {
        /// Room id
        room: String,
    },
    /// Collaboration stopped for the room.
    Stopped {
        /// Room id
        room: String,
    },
    /// The transport reported a connection error. The session is now stopped
    /// and errored; it will not reconnect on its own.
    ConnectionError {
        /// Room id
        room: String,
        /// Transport message
        message: String,
    },
    /// A remote peer changed the shared config.
    ConfigChanged(ConfigUpdate),
    /// The initial handshake with a peer or relay completed.
    Synced {
        /// Room id
        room: String,
    },
}

/// Thread-safe registry for managing event subscriptions.
///
/// The registry supports:
/// - Subscribing to events with unique IDs
/// - Unsubscribing by ID
/// - Emitting events to all active subscribers
///
/// # Example
///
/// ```ignore
/// use inkboard_core::events::{CallbackRegistry, SessionEvent};
/// use std::sync::Arc;
///
/// let registry = CallbackRegistry::<SessionEvent>::new();
///
/// let id = registry.subscribe(Arc::new(|event| {
///     println!("Event: {:?}", event);
/// }));
///
/// registry.emit(&SessionEvent::Started { room: "abc".into() });
///
/// registry.unsubscribe(id);
/// ```
pub struct CallbackRegistry<E> {
    /// Map of subscription IDs to callbacks.
    callbacks: RwLock<HashMap<SubscriptionId, EventCallback<E>>>,
    /// Counter for generating unique subscription IDs.
    next_id: AtomicU64,
}

impl<E> CallbackRegistry<E> {
    /// Create a new empty callback registry.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to events.
    ///
    /// Returns a subscription ID that can be used to unsubscribe later.
    pub fn subscribe(&self, callback: EventCallback<E>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.insert(id, callback);
        id
    }

    /// Unsubscribe from events.
    ///
    /// Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.remove(&id).is_some()
    }

    /// Emit an event to all registered callbacks.
    ///
    /// Callbacks are invoked synchronously in an undefined order.
    /// If a callback panics, it does not affect other callbacks.
    pub fn emit(&self, event: &E) {
        // Snapshot the callbacks so a subscriber may (un)subscribe from inside its callback.
        let callbacks: Vec<EventCallback<E>> = {
            let callbacks = self.callbacks.read().unwrap();
            callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
        }
    }

    /// Get the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let callbacks = self.callbacks.read().unwrap();
        callbacks.len()
    }

    /// Clear all subscriptions.
    pub fn clear(&self) {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.clear();
    }
}

impl<E> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for CallbackRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let callbacks = self.callbacks.read().unwrap();
        f.debug_struct("CallbackRegistry")
            .field("subscriber_count", &callbacks.len())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let registry = CallbackRegistry::<SessionEvent>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let _id = registry.subscribe(Arc::new(move |_event| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(registry.subscriber_count(), 1);
        registry.emit(&SessionEvent::Started { room: "abc".into() });
        registry.emit(&SessionEvent::Stopped { room: "abc".into() });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = CallbackRegistry::<SessionEvent>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        let id = registry.subscribe(Arc::new(move |event: &SessionEvent| {
            seen_clone.lock().unwrap().push(event.clone());
        }));

        registry.emit(&SessionEvent::Synced { room: "r".into() });
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&SessionEvent::Synced { room: "r".into() });

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_break_others() {
        let registry = CallbackRegistry::<u32>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(|_| panic!("boom")));
        let counter_clone = Arc::clone(&counter);
        registry.subscribe(Arc::new(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
