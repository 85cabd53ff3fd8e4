//! In-process relay.
//!
//! [`MemoryHub`] routes messages between providers of the same room without
//! any network. It backs the test suite and local-only rooms, and can be
//! switched offline to exercise connection failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{Provider, ProviderEvent, Transport};
use crate::error::{CollabError, Result};

type Inbox = Arc<Mutex<VecDeque<ProviderEvent>>>;

#[derive(Default)]
struct HubState {
    /// room -> (peer id -> inbox) of connected peers
    rooms: HashMap<String, HashMap<u64, Inbox>>,
    offline: bool,
}

/// In-memory relay shared by all providers it creates.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    next_peer: Arc<AtomicU64>,
}

impl MemoryHub {
    /// Create a new empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider for `room`.
    pub fn provider_for(&self, room: &str) -> MemoryProvider {
        MemoryProvider {
            hub: self.clone(),
            room: room.to_string(),
            peer: self.next_peer.fetch_add(1, Ordering::SeqCst),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            connected: AtomicBool::new(false),
        }
    }

    /// Refuse new connections while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Drop every connection in `room`, notifying each peer with a connection error.
    pub fn drop_room(&self, room: &str) {
        let peers = self.state.lock().unwrap().rooms.remove(room);
        for inbox in peers.into_iter().flat_map(|peers| peers.into_values()) {
            inbox
                .lock()
                .unwrap()
                .push_back(ProviderEvent::ConnectionError("connection lost".into()));
        }
    }

    /// Number of connected peers in `room`.
    pub fn peer_count(&self, room: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .rooms
            .get(room)
            .map_or(0, HashMap::len)
    }
}

impl Transport for MemoryHub {
    fn provider(&self, room: &str) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(self.provider_for(room)))
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("MemoryHub")
            .field("rooms", &state.rooms.len())
            .field("offline", &state.offline)
            .finish()
    }
}

/// Provider connected through a [`MemoryHub`].
pub struct MemoryProvider {
    hub: MemoryHub,
    room: String,
    peer: u64,
    inbox: Inbox,
    connected: AtomicBool,
}

impl Provider for MemoryProvider {
    fn room(&self) -> &str {
        &self.room
    }

    fn connect(&self) -> Result<()> {
        let mut state = self.hub.state.lock().unwrap();
        if state.offline {
            self.inbox
                .lock()
                .unwrap()
                .push_back(ProviderEvent::ConnectionError("relay unreachable".into()));
            return Ok(());
        }
        state
            .rooms
            .entry(self.room.clone())
            .or_default()
            .insert(self.peer, Arc::clone(&self.inbox));
        self.connected.store(true, Ordering::SeqCst);
        self.inbox.lock().unwrap().push_back(ProviderEvent::Connected);
        Ok(())
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut state = self.hub.state.lock().unwrap();
        if let Some(peers) = state.rooms.get_mut(&self.room) {
            peers.remove(&self.peer);
        }
        self.inbox
            .lock()
            .unwrap()
            .push_back(ProviderEvent::Disconnected);
    }

    fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        // The hub may have dropped us (see `MemoryHub::drop_room`).
        let state = self.hub.state.lock().unwrap();
        state
            .rooms
            .get(&self.room)
            .is_some_and(|peers| peers.contains_key(&self.peer))
    }

    fn send(&self, message: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(CollabError::NotConnected(self.room.clone()));
        }
        let state = self.hub.state.lock().unwrap();
        if let Some(peers) = state.rooms.get(&self.room) {
            for (peer, inbox) in peers {
                if *peer != self.peer {
                    inbox
                        .lock()
                        .unwrap()
                        .push_back(ProviderEvent::Message(message.clone()));
                }
            }
        }
        Ok(())
    }

    fn drain_events(&self) -> Vec<ProviderEvent> {
        let mut events = self.inbox.lock().unwrap();
        let drained: Vec<ProviderEvent> = events.drain(..).collect();
        // A connection error means we are no longer part of the room.
        if drained
            .iter()
            .any(|e| matches!(e, ProviderEvent::ConnectionError(_)))
        {
            self.connected.store(false, Ordering::SeqCst);
        }
        drained
    }
}

impl Drop for MemoryProvider {
    fn drop(&mut self) {
        if let Ok(mut state) = self.hub.state.lock()
            && let Some(peers) = state.rooms.get_mut(&self.room)
        {
            peers.remove(&self.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_skips_sender() {
        let hub = MemoryHub::new();
        let a = hub.provider_for("abc");
        let b = hub.provider_for("abc");
        let other_room = hub.provider_for("xyz");
        a.connect().unwrap();
        b.connect().unwrap();
        other_room.connect().unwrap();
        assert_eq!(a.drain_events(), vec![ProviderEvent::Connected]);
        b.drain_events();
        other_room.drain_events();

        a.send(vec![1, 2]).unwrap();
        assert!(a.drain_events().is_empty());
        assert_eq!(b.drain_events(), vec![ProviderEvent::Message(vec![1, 2])]);
        assert!(other_room.drain_events().is_empty());
    }

    #[test]
    fn test_offline_hub_reports_connection_error() {
        let hub = MemoryHub::new();
        hub.set_offline(true);
        let a = hub.provider_for("abc");
        a.connect().unwrap();
        assert!(!a.is_connected());
        assert!(matches!(
            a.drain_events().as_slice(),
            [ProviderEvent::ConnectionError(_)]
        ));
        assert!(matches!(a.send(vec![0]), Err(CollabError::NotConnected(_))));
    }

    #[test]
    fn test_drop_room_disconnects_everyone() {
        let hub = MemoryHub::new();
        let a = hub.provider_for("abc");
        a.connect().unwrap();
        a.drain_events();
        assert_eq!(hub.peer_count("abc"), 1);

        hub.drop_room("abc");
        assert!(!a.is_connected());
        assert!(matches!(
            a.drain_events().as_slice(),
            [ProviderEvent::ConnectionError(_)]
        ));
        assert_eq!(hub.peer_count("abc"), 0);
    }

    #[test]
    fn test_disconnect_leaves_room() {
        let hub = MemoryHub::new();
        let a = hub.provider_for("abc");
        a.connect().unwrap();
        a.disconnect();
        assert_eq!(hub.peer_count("abc"), 0);
        assert_eq!(
            a.drain_events(),
            vec![ProviderEvent::Connected, ProviderEvent::Disconnected]
        );
    }
}
