//! Replica observer bookkeeping for a session.
//!
//! Bindings and replicators never hold their `yrs` subscriptions directly.
//! They register an *arm* function with the session's [`ObserverRegistry`],
//! which owns the live subscription. That lets the session drop every
//! observer before it disconnects or releases the replica, and re-create
//! them when collaboration starts again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use yrs::Subscription;

/// Handle of a registered observer.
pub type ObserverId = u64;

/// Creates (subscribes) an observer on the replica.
pub type ArmFn = Box<dyn Fn() -> Subscription + Send + Sync>;

struct Entry {
    label: &'static str,
    arm: ArmFn,
    active: Option<Subscription>,
}

/// Observers registered against one replica.
pub struct ObserverRegistry {
    entries: Mutex<HashMap<ObserverId, Entry>>,
    next_id: AtomicU64,
    armed: AtomicBool,
}

impl ObserverRegistry {
    /// Create an empty, armed registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            armed: AtomicBool::new(true),
        }
    }

    /// Register an observer. It is subscribed immediately if the registry is armed.
    pub fn register(&self, label: &'static str, arm: ArmFn) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let active = self.armed.load(Ordering::SeqCst).then(|| arm());
        self.entries
            .lock()
            .unwrap()
            .insert(id, Entry { label, arm, active });
        id
    }

    /// Remove an observer, dropping its subscription.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let removed = self.entries.lock().unwrap().remove(&id);
        removed.is_some()
    }

    /// Whether `id` is registered and currently subscribed.
    pub fn is_active(&self, id: ObserverId) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(|entry| entry.active.is_some())
    }

    /// Drop every live subscription, keeping registrations for [`arm_all`](Self::arm_all).
    pub fn disarm_all(&self) {
        self.armed.store(false, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.active.take().is_some() {
                log::debug!("[Session] Disarmed {} observer", entry.label);
            }
        }
    }

    /// Re-subscribe every registered observer.
    pub fn arm_all(&self) {
        self.armed.store(true, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.active.is_none() {
                entry.active = Some((entry.arm)());
            }
        }
    }

    /// Unregister everything.
    pub fn clear(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.entries.lock().unwrap().clear();
    }

    /// Number of live subscriptions.
    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.active.is_some())
            .count()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("registered", &self.len())
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use yrs::{Doc, Map, Observable, Transact};

    fn counting_observer(doc: &Doc, counter: &Arc<AtomicUsize>) -> ArmFn {
        let map = doc.get_or_insert_map("m");
        let counter = Arc::clone(counter);
        Box::new(move || {
            let counter = Arc::clone(&counter);
            map.observe(move |_txn, _event| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn touch(doc: &Doc, value: i64) {
        let map = doc.get_or_insert_map("m");
        let mut txn = doc.transact_mut();
        map.insert(&mut txn, "k", value);
    }

    #[test]
    fn test_disarm_and_rearm() {
        let doc = Doc::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = ObserverRegistry::new();
        let id = registry.register("test", counting_observer(&doc, &counter));
        assert!(registry.is_active(id));

        touch(&doc, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        registry.disarm_all();
        assert_eq!(registry.active_count(), 0);
        touch(&doc, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        registry.arm_all();
        touch(&doc, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_while_disarmed_waits_for_arm() {
        let doc = Doc::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = ObserverRegistry::new();
        registry.disarm_all();

        let id = registry.register("test", counting_observer(&doc, &counter));
        assert!(!registry.is_active(id));
        touch(&doc, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        registry.arm_all();
        assert!(registry.is_active(id));
    }

    #[test]
    fn test_unregister_and_clear() {
        let doc = Doc::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = ObserverRegistry::new();
        let a = registry.register("a", counting_observer(&doc, &counter));
        registry.register("b", counting_observer(&doc, &counter));

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
        touch(&doc, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
