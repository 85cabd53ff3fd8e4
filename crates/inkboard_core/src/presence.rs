//! Peer presence (awareness) for collaborative sessions.
//!
//! A [`PresenceChannel`] holds the ephemeral, non-persisted state of every
//! peer in a room: display name, color, cursor, mouse position. It is keyed
//! by numeric [`PeerId`] and is passed into a session explicitly rather than
//! living in a global.
//!
//! # Wire format (y-protocols awareness)
//!
//! ```text
//! varUint(count)
//! count x { varUint(peer id), varUint(clock), varString(JSON state | "null") }
//! ```
//!
//! A peer's entry only replaces the known one when its clock is newer. A
//! `null` state removes the peer.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crdt::sync::{read_var_string, read_var_uint, write_var_string, write_var_uint};
use crate::error::{CollabError, Result};
use crate::events::{CallbackRegistry, EventCallback, SubscriptionId};

/// Numeric identity of a peer on the presence channel.
pub type PeerId = u64;

/// Presence state of one peer: a JSON object of named fields.
pub type PeerState = Map<String, Value>;

/// Field holding the [`UserInfo`] in a peer state.
pub const USER_FIELD: &str = "user";

const ADJECTIVES: &[&str] = &[
    "Amber", "Brave", "Calm", "Clever", "Curious", "Eager", "Gentle", "Happy", "Jolly", "Lucky",
    "Mellow", "Nimble", "Polite", "Quiet", "Rapid", "Shiny", "Swift", "Tidy", "Witty", "Zesty",
];

const ANIMALS: &[&str] = &[
    "Badger", "Beaver", "Crane", "Dolphin", "Falcon", "Ferret", "Gecko", "Heron", "Koala", "Lemur",
    "Lynx", "Marmot", "Otter", "Panda", "Puffin", "Raven", "Seal", "Tapir", "Walrus", "Yak",
];

/// Display identity a peer announces to others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Display name
    pub name: String,
    /// Cursor/selection color (`#rrggbb`)
    pub color: String,
    /// Background for name labels (`#rrggbb`)
    pub background: String,
    /// Text color on `background`
    pub foreground: String,
}

impl UserInfo {
    /// A random "Adjective Animal" name with colors derived from `peer`.
    pub fn random(peer: PeerId) -> Self {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Anonymous");
        let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Peer");

        let hue = (peer % 360) as f32 / 360.0;
        let color = hex(hsl_to_rgb(hue, 0.7, 0.5));
        let background = hex(hsl_to_rgb(hue, 0.7, 0.85));

        Self {
            name: format!("{} {}", adjective, animal),
            color,
            background,
            foreground: "#1a1a1a".to_string(),
        }
    }
}

fn hex((r, g, b): (f32, f32, f32)) -> String {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Where a presence change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOrigin {
    /// The local peer changed its own state.
    Local,
    /// An awareness update from the network.
    Remote,
}

/// Peers whose presence changed in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    /// Peers seen for the first time
    pub added: Vec<PeerId>,
    /// Peers whose state changed
    pub updated: Vec<PeerId>,
    /// Peers that left
    pub removed: Vec<PeerId>,
    /// Source of the change
    pub origin: PresenceOrigin,
}

impl PresenceEvent {
    fn new(origin: PresenceOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    clock: u64,
    /// `None` once the peer left; the clock is kept to reject stale updates.
    state: Option<PeerState>,
}

/// Peer-keyed presence channel with change notifications.
pub struct PresenceChannel {
    local_id: PeerId,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    listeners: CallbackRegistry<PresenceEvent>,
}

impl PresenceChannel {
    /// Create a channel for the local peer `local_id`, with an empty local state.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
            listeners: CallbackRegistry::new(),
        }
    }

    /// Create a channel with a random peer id and a random [`UserInfo`].
    pub fn with_random_user() -> Self {
        let channel = Self::new(rand::random::<u32>() as PeerId);
        channel.set_user(&UserInfo::random(channel.local_id));
        channel
    }

    /// Local peer id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Subscribe to presence changes.
    pub fn subscribe(&self, callback: EventCallback<PresenceEvent>) -> SubscriptionId {
        self.listeners.subscribe(callback)
    }

    /// Unsubscribe from presence changes.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Replace the local state. `None` announces that the local peer left.
    pub fn set_local_state(&self, state: Option<PeerState>) {
        let mut event = PresenceEvent::new(PresenceOrigin::Local);
        {
            let mut peers = self.peers.write().unwrap();
            let entry = peers.entry(self.local_id).or_insert(PeerEntry {
                clock: 0,
                state: None,
            });
            let had_state = entry.state.is_some();
            entry.clock += 1;
            match (had_state, state.is_some()) {
                (false, true) => event.added.push(self.local_id),
                (true, true) => event.updated.push(self.local_id),
                (true, false) => event.removed.push(self.local_id),
                (false, false) => {}
            }
            entry.state = state;
        }
        if !event.is_empty() {
            self.listeners.emit(&event);
        }
    }

    /// Set one field of the local state, creating the state if needed.
    pub fn set_local_state_field(&self, key: &str, value: Value) {
        let mut state = self.local_state().unwrap_or_default();
        state.insert(key.to_string(), value);
        self.set_local_state(Some(state));
    }

    /// Announce `user` as the local display identity.
    pub fn set_user(&self, user: &UserInfo) {
        match serde_json::to_value(user) {
            Ok(value) => self.set_local_state_field(USER_FIELD, value),
            Err(e) => log::warn!("[Presence] Failed to encode user info: {}", e),
        }
    }

    /// Local state, if the local peer is present.
    pub fn local_state(&self) -> Option<PeerState> {
        self.peer_state(self.local_id)
    }

    /// Mark the local peer as gone.
    pub fn remove_local(&self) {
        self.set_local_state(None);
    }

    /// State of any peer (local included).
    pub fn peer_state(&self, peer: PeerId) -> Option<PeerState> {
        let peers = self.peers.read().unwrap();
        peers.get(&peer).and_then(|entry| entry.state.clone())
    }

    /// Display identity of a peer, if it announced one.
    pub fn user(&self, peer: PeerId) -> Option<UserInfo> {
        self.peer_state(peer)
            .and_then(|state| state.get(USER_FIELD).cloned())
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Present remote peers and their states.
    pub fn remote_peers(&self) -> Vec<(PeerId, PeerState)> {
        let peers = self.peers.read().unwrap();
        let mut out: Vec<(PeerId, PeerState)> = peers
            .iter()
            .filter(|(id, _)| **id != self.local_id)
            .filter_map(|(id, entry)| entry.state.clone().map(|state| (*id, state)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Forget every remote peer, e.g. after the connection closed.
    pub fn clear_remote(&self) {
        let mut event = PresenceEvent::new(PresenceOrigin::Remote);
        {
            let mut peers = self.peers.write().unwrap();
            let local_id = self.local_id;
            peers.retain(|id, entry| {
                if *id == local_id {
                    return true;
                }
                if entry.state.is_some() {
                    event.removed.push(*id);
                }
                false
            });
        }
        if !event.is_empty() {
            self.listeners.emit(&event);
        }
    }

    /// Encode an awareness update for the given peers.
    pub fn encode_update(&self, ids: &[PeerId]) -> Vec<u8> {
        let peers = self.peers.read().unwrap();
        let entries: Vec<(PeerId, &PeerEntry)> = ids
            .iter()
            .filter_map(|id| peers.get(id).map(|entry| (*id, entry)))
            .collect();

        let mut buf = Vec::new();
        write_var_uint(&mut buf, entries.len() as u64);
        for (id, entry) in entries {
            write_var_uint(&mut buf, id);
            write_var_uint(&mut buf, entry.clock);
            let json = match &entry.state {
                Some(state) => Value::Object(state.clone()).to_string(),
                None => "null".to_string(),
            };
            write_var_string(&mut buf, &json);
        }
        buf
    }

    /// Encode an awareness update for the local peer.
    pub fn encode_local_update(&self) -> Vec<u8> {
        self.encode_update(&[self.local_id])
    }

    /// Apply an awareness update received from the network.
    ///
    /// Entries for the local peer and entries with stale clocks are ignored.
    /// Listeners are notified once with every change.
    pub fn apply_remote(&self, update: &[u8]) -> Result<PresenceEvent> {
        let entries = decode_entries(update)?;
        let mut event = PresenceEvent::new(PresenceOrigin::Remote);
        {
            let mut peers = self.peers.write().unwrap();
            for (id, clock, state) in entries {
                if id == self.local_id {
                    continue;
                }
                let known = peers.get(&id);
                let newer = known.is_none_or(|entry| clock > entry.clock);
                if !newer {
                    continue;
                }
                let was_present = known.is_some_and(|entry| entry.state.is_some());
                match (was_present, state.is_some()) {
                    (false, true) => event.added.push(id),
                    (true, true) => event.updated.push(id),
                    (true, false) => event.removed.push(id),
                    (false, false) => {}
                }
                peers.insert(id, PeerEntry { clock, state });
            }
        }
        if !event.is_empty() {
            log::debug!(
                "[Presence] {} added, {} updated, {} removed",
                event.added.len(),
                event.updated.len(),
                event.removed.len()
            );
            self.listeners.emit(&event);
        }
        Ok(event)
    }
}

fn decode_entries(update: &[u8]) -> Result<Vec<(PeerId, u64, Option<PeerState>)>> {
    let malformed = |what: &str| CollabError::MalformedRemoteUpdate(format!("awareness: {}", what));

    let (count, mut offset) = read_var_uint(update).ok_or_else(|| malformed("missing count"))?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let (id, n) = read_var_uint(&update[offset..]).ok_or_else(|| malformed("peer id"))?;
        offset += n;
        let (clock, n) = read_var_uint(&update[offset..]).ok_or_else(|| malformed("clock"))?;
        offset += n;
        let (json, n) = read_var_string(&update[offset..]).ok_or_else(|| malformed("state"))?;
        offset += n;
        let state = match serde_json::from_str::<Value>(&json)? {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => return Err(malformed(&format!("state is not an object: {}", other))),
        };
        entries.push((id, clock, state));
    }
    Ok(entries)
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.read().unwrap();
        f.debug_struct("PresenceChannel")
            .field("local_id", &self.local_id)
            .field("peers", &peers.len())
            .finish()
    }
}
