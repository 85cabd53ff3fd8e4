//! Replicated document sessions.
//!
//! A [`ReplicatedDocumentSession`] owns one replica bound to a room, the
//! transport provider connecting it to the room's peers, and the injected
//! presence channel. Bindings and replicators attach to a session and
//! register their replica observers with its [`ObserverRegistry`].
//!
//! # Threading
//!
//! All replica mutation happens synchronously on the owner's thread. Network
//! I/O runs inside the provider; inbound traffic is queued there and applied
//! by [`ReplicatedDocumentSession::poll`].
//!
//! # Echo suppression
//!
//! Every local transaction is tagged with the session's [`ReplicaId`],
//! network updates with [`REMOTE_ORIGIN`] and stored state with
//! [`LOAD_ORIGIN`]. Observers classify the tag with an [`OriginClassifier`]
//! before deriving any local-state change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Doc, Map, MapRef, Observable, OffsetKind, Options, Origin, Out, ReadTxn, StateVector,
    Subscription, Transact, UndoManager, Update,
};

use super::observers::ObserverRegistry;
use super::storage::Storage;
use super::sync::{Message, SyncMessage, SyncProtocol};
use super::types::{LOAD_ORIGIN, OriginClassifier, REMOTE_ORIGIN, ReplicaId, UpdateOrigin};
use crate::config::{Config, ConfigUpdate, SharedConfig};
use crate::error::{CollabError, Result};
use crate::events::{CallbackRegistry, EventCallback, SessionEvent, SubscriptionId};
use crate::model::{File, now_millis};
use crate::presence::{PresenceChannel, PresenceOrigin, UserInfo};
use crate::transport::{Provider, ProviderEvent, Transport};

/// Name of the shared config map.
pub const CONFIG_MAP: &str = "config";

const FONT_KEY: &str = "font";
const FONT_SIZE_KEY: &str = "fontSize";
const CONTENT_WIDTH_KEY: &str = "contentWidth";

/// What a room holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    /// A rich-text or markdown file
    Editor,
    /// A code file
    Code,
    /// A canvas
    Canvas,
}

impl RoomKind {
    /// Path segment used for the room.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Editor => "editor",
            RoomKind::Code => "code",
            RoomKind::Canvas => "canvas",
        }
    }
}

impl std::fmt::Display for RoomKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Path of a live room, e.g. `/editor/abc`.
pub fn room_path(kind: RoomKind, room: &str) -> String {
    format!("/{}/{}", kind, room)
}

/// The process-wide "current room" shown by the UI (address bar, share link).
pub trait RoomIndicator: Send + Sync {
    /// Set the live room path, or `None` when no room is live.
    fn set_room(&self, path: Option<String>);
}

/// [`RoomIndicator`] that just remembers the current path.
#[derive(Debug, Default)]
pub struct SharedRoomIndicator {
    current: RwLock<Option<String>>,
}

impl SharedRoomIndicator {
    /// Create an indicator with no live room.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live room path.
    pub fn current(&self) -> Option<String> {
        self.current.read().unwrap().clone()
    }
}

impl RoomIndicator for SharedRoomIndicator {
    fn set_room(&self, path: Option<String>) {
        *self.current.write().unwrap() = path;
    }
}

/// Collaborators shared by every session of the application.
#[derive(Clone)]
pub struct SessionContext {
    /// Allocates providers for rooms
    pub transport: Arc<dyn Transport>,
    /// Peer presence channel
    pub presence: Arc<PresenceChannel>,
    /// Local config, seeded into and mirrored from the replica
    pub config: SharedConfig,
    /// "Current room" UI collaborator
    pub indicator: Arc<dyn RoomIndicator>,
    /// Optional update log for replica changes
    pub storage: Option<Arc<dyn Storage>>,
}

/// Connection status of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// Collaboration is on
    pub started: bool,
    /// Initial handshake completed since the last start
    pub synced: bool,
    /// Last transport error; set together with `started == false`
    pub error: Option<String>,
}

/// One replica bound to a room, its provider and presence.
pub struct ReplicatedDocumentSession {
    room: String,
    kind: RoomKind,
    doc: Doc,
    replica: ReplicaId,
    classifier: OriginClassifier,
    undoing: Arc<AtomicBool>,
    provider: Arc<dyn Provider>,
    protocol: SyncProtocol,
    presence: Arc<PresenceChannel>,
    presence_subscription: Mutex<Option<SubscriptionId>>,
    user: UserInfo,
    config: SharedConfig,
    config_map: MapRef,
    indicator: Arc<dyn RoomIndicator>,
    observers: Arc<ObserverRegistry>,
    events: Arc<CallbackRegistry<SessionEvent>>,
    status: Arc<Mutex<SessionStatus>>,
    undo: Mutex<UndoManager>,
    update_subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl ReplicatedDocumentSession {
    /// Create a session for an empty replica.
    ///
    /// The room's primary shared type is the undo scope: the rich-text
    /// fragment, the code text or the canvas element map, each named after
    /// the room.
    pub fn create(
        room: &str,
        kind: RoomKind,
        auto_connect: bool,
        ctx: &SessionContext,
    ) -> Result<Self> {
        Self::build(room, kind, auto_connect, ctx, None)
    }

    /// Create a session for `file`, merging its stored replica bytes before
    /// connecting. The file's code text or rich-text fragment is the undo scope.
    pub fn create_from_document(file: &File, auto_connect: bool, ctx: &SessionContext) -> Result<Self> {
        let kind = if file.code {
            RoomKind::Code
        } else {
            RoomKind::Editor
        };
        Self::build(&file.id, kind, auto_connect, ctx, Some(file))
    }

    fn build(
        room: &str,
        kind: RoomKind,
        auto_connect: bool,
        ctx: &SessionContext,
        file: Option<&File>,
    ) -> Result<Self> {
        log::info!(
            "[Session] Create replica (room={}, kind={}, connect={})",
            room,
            kind,
            auto_connect
        );

        let doc = Doc::with_options(Options {
            skip_gc: true,
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        });
        let replica = ReplicaId::new();
        let undoing = Arc::new(AtomicBool::new(false));
        let classifier = OriginClassifier::new(replica.clone(), Arc::clone(&undoing));

        if let Some(file) = file
            && !file.ydoc.is_empty()
        {
            let update = Update::decode_v1(&file.ydoc)
                .map_err(|e| CollabError::Crdt(format!("Failed to decode stored replica: {}", e)))?;
            let mut txn = doc.transact_mut_with(Origin::from(LOAD_ORIGIN));
            txn.apply_update(update)
                .map_err(|e| CollabError::Crdt(format!("Failed to merge stored replica: {}", e)))?;
        }

        let mut undo = match kind {
            RoomKind::Editor => UndoManager::new(&doc, &doc.get_or_insert_xml_fragment(room)),
            RoomKind::Code => UndoManager::new(&doc, &doc.get_or_insert_text(room)),
            RoomKind::Canvas => UndoManager::new(&doc, &doc.get_or_insert_map(room)),
        };
        undo.include_origin(replica.origin());

        let provider = ctx.transport.provider(&format!("{}/{}", kind, room))?;
        let protocol = SyncProtocol::new(doc.clone(), Origin::from(REMOTE_ORIGIN));
        let config_map = doc.get_or_insert_map(CONFIG_MAP);

        let user = match ctx.presence.user(ctx.presence.local_id()) {
            Some(user) => user,
            None => {
                let user = UserInfo::random(ctx.presence.local_id());
                ctx.presence.set_user(&user);
                user
            }
        };

        let session = Self {
            room: room.to_string(),
            kind,
            doc,
            replica,
            classifier,
            undoing,
            provider,
            protocol,
            presence: Arc::clone(&ctx.presence),
            presence_subscription: Mutex::new(None),
            user,
            config: Arc::clone(&ctx.config),
            config_map,
            indicator: Arc::clone(&ctx.indicator),
            observers: Arc::new(ObserverRegistry::new()),
            events: Arc::new(CallbackRegistry::new()),
            status: Arc::new(Mutex::new(SessionStatus::default())),
            undo: Mutex::new(undo),
            update_subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        session.seed_config();
        session.register_config_observer();
        session.observe_updates(ctx.storage.clone())?;
        session.observe_presence();

        if auto_connect {
            if let Err(e) = session.start() {
                log::error!("[Session] Auto-connect failed for {}: {}", session.room, e);
            }
        } else {
            session.indicator.set_room(None);
        }

        Ok(session)
    }

    // ==================== Accessors ====================

    /// Room id (the file or canvas id).
    pub fn room(&self) -> &str {
        &self.room
    }

    /// What the room holds.
    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    /// The replica.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Local replica id; the origin tag of every local transaction.
    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica
    }

    /// Origin tag for local transactions.
    pub fn local_origin(&self) -> Origin {
        self.replica.origin()
    }

    /// Classifier for observer callbacks.
    pub fn classifier(&self) -> OriginClassifier {
        self.classifier.clone()
    }

    /// Observers registered against this replica.
    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    /// Presence channel.
    pub fn presence(&self) -> &Arc<PresenceChannel> {
        &self.presence
    }

    /// Local display identity.
    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    /// Current connection status.
    pub fn status(&self) -> SessionStatus {
        self.status.lock().unwrap().clone()
    }

    /// Whether collaboration is on.
    pub fn is_started(&self) -> bool {
        self.status.lock().unwrap().started
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to session events.
    pub fn subscribe(&self, callback: EventCallback<SessionEvent>) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    /// Unsubscribe from session events.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // ==================== Lifecycle ====================

    /// Start collaborating: re-arm observers and connect the provider.
    pub fn start(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CollabError::NotConnected(self.room.clone()));
        }
        if self.is_started() {
            return Ok(());
        }

        log::info!("[Session] Start collaboration for {}", self.room);
        self.observers.arm_all();
        if self.presence.local_state().is_none() {
            self.presence.set_user(&self.user);
        }

        if let Err(e) = self.provider.connect() {
            let message = e.to_string();
            self.fail(&message);
            return Err(CollabError::Transport(message));
        }

        {
            let mut status = self.status.lock().unwrap();
            status.started = true;
            status.synced = false;
            status.error = None;
        }
        self.indicator.set_room(Some(room_path(self.kind, &self.room)));
        self.events.emit(&SessionEvent::Started {
            room: self.room.clone(),
        });
        Ok(())
    }

    /// Stop collaborating. Every replica observer is disarmed before the
    /// provider disconnects.
    pub fn stop(&self) {
        if !self.is_started() {
            return;
        }

        log::info!("[Session] Stop collaboration for {}", self.room);
        self.observers.disarm_all();
        // Announces that we left while the connection is still up
        self.presence.remove_local();
        self.provider.disconnect();
        self.presence.clear_remote();

        {
            let mut status = self.status.lock().unwrap();
            status.started = false;
            status.synced = false;
            status.error = None;
        }
        self.indicator.set_room(None);
        self.events.emit(&SessionEvent::Stopped {
            room: self.room.clone(),
        });
    }

    /// Stop and release everything attached to the replica. The session
    /// cannot be started again.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        self.observers.clear();
        self.update_subscription.lock().unwrap().take();
        if let Some(id) = self.presence_subscription.lock().unwrap().take() {
            self.presence.unsubscribe(id);
        }
        self.events.clear();
        log::info!("[Session] Closed {}", self.room);
    }

    /// Transport failure: stopped + errored, no retry.
    fn fail(&self, message: &str) {
        log::error!("[Session] Connection error in {}: {}", self.room, message);
        self.provider.disconnect();
        self.presence.clear_remote();
        {
            let mut status = self.status.lock().unwrap();
            status.started = false;
            status.synced = false;
            status.error = Some(message.to_string());
        }
        self.indicator.set_room(None);
        self.events.emit(&SessionEvent::ConnectionError {
            room: self.room.clone(),
            message: message.to_string(),
        });
    }

    // ==================== Network ====================

    /// Apply everything the provider queued since the last call.
    ///
    /// Malformed messages are logged and dropped. A connection error stops
    /// the session and is returned as [`CollabError::Transport`].
    pub fn poll(&self) -> Result<usize> {
        let events = self.provider.drain_events();
        let count = events.len();
        let mut failure = None;

        for event in events {
            match event {
                ProviderEvent::Connected => self.on_connected(),
                ProviderEvent::Disconnected => {
                    log::info!("[Session] Disconnected from {}", self.room);
                }
                ProviderEvent::Message(data) => {
                    if !self.is_started() {
                        log::debug!("[Session] Dropping message for stopped room {}", self.room);
                        continue;
                    }
                    if let Err(e) = self.handle_message(&data) {
                        log::warn!("[Y-sync] Dropping message in {}: {}", self.room, e);
                    }
                }
                ProviderEvent::ConnectionError(message) => {
                    self.fail(&message);
                    failure = Some(message);
                }
            }
        }

        match failure {
            Some(message) => Err(CollabError::Transport(message)),
            None => Ok(count),
        }
    }

    fn on_connected(&self) {
        log::info!("[Session] Connected to {}", self.room);
        self.send(self.protocol.create_sync_step1());
        if self.presence.local_state().is_some() {
            self.send(Message::encode_awareness(
                &self.presence.encode_local_update(),
            ));
        }
    }

    fn handle_message(&self, data: &[u8]) -> Result<()> {
        match Message::decode(data)? {
            Some(Message::Sync(messages)) => {
                let outcome = self.protocol.handle(messages)?;
                if let Some(response) = outcome.response {
                    self.send(response);
                }
                if outcome.synced {
                    let first = {
                        let mut status = self.status.lock().unwrap();
                        !std::mem::replace(&mut status.synced, true)
                    };
                    if first {
                        log::info!("[Y-sync] Room {} synced", self.room);
                        self.events.emit(&SessionEvent::Synced {
                            room: self.room.clone(),
                        });
                    }
                }
            }
            Some(Message::Awareness(update)) => {
                self.presence.apply_remote(&update)?;
            }
            None => {}
        }
        Ok(())
    }

    fn send(&self, message: Vec<u8>) {
        if let Err(e) = self.provider.send(message) {
            log::debug!("[Session] Not sent to {}: {}", self.room, e);
        }
    }

    fn observe_updates(&self, storage: Option<Arc<dyn Storage>>) -> Result<()> {
        let provider = Arc::clone(&self.provider);
        let classifier = self.classifier.clone();
        let room = self.room.clone();

        let subscription = self
            .doc
            .observe_update_v1(move |txn, event| {
                let origin = classifier.classify(txn.origin());
                if let Some(storage) = &storage
                    && origin != UpdateOrigin::Load
                    && let Err(e) = storage.append_update(&room, &event.update, origin)
                {
                    log::warn!("[Session] Failed to log update for {}: {}", room, e);
                }
                if matches!(origin, UpdateOrigin::Local | UpdateOrigin::UndoRedo)
                    && provider.is_connected()
                {
                    let message = SyncMessage::Update(event.update.clone()).encode();
                    if let Err(e) = provider.send(message) {
                        log::warn!("[Y-sync] Failed to broadcast update for {}: {}", room, e);
                    }
                }
            })
            .map_err(|e| CollabError::Crdt(format!("Failed to observe replica updates: {}", e)))?;

        *self.update_subscription.lock().unwrap() = Some(subscription);
        Ok(())
    }

    fn observe_presence(&self) {
        let provider = Arc::clone(&self.provider);
        let presence = Arc::downgrade(&self.presence);
        let id = self.presence.subscribe(Arc::new(move |event| {
            if event.origin != PresenceOrigin::Local || !provider.is_connected() {
                return;
            }
            if let Some(presence) = presence.upgrade() {
                let message = Message::encode_awareness(&presence.encode_local_update());
                if let Err(e) = provider.send(message) {
                    log::debug!("[Presence] Failed to broadcast local state: {}", e);
                }
            }
        }));
        *self.presence_subscription.lock().unwrap() = Some(id);
    }

    // ==================== Config ====================

    fn seed_config(&self) {
        let config = self.config.read().unwrap().clone();
        let mut txn = self.doc.transact_mut_with(self.local_origin());
        if let Some(font) = &config.font {
            self.config_map.insert(&mut txn, FONT_KEY, font.as_str());
        }
        self.config_map
            .insert(&mut txn, FONT_SIZE_KEY, config.font_size);
        self.config_map
            .insert(&mut txn, CONTENT_WIDTH_KEY, config.content_width);
    }

    fn register_config_observer(&self) {
        let map = self.config_map.clone();
        let classifier = self.classifier.clone();
        let config = Arc::clone(&self.config);
        let events = Arc::clone(&self.events);

        self.observers.register(
            "config",
            Box::new(move || {
                let classifier = classifier.clone();
                let config = Arc::clone(&config);
                let events = Arc::clone(&events);
                map.observe(move |txn, event| {
                    if classifier.classify(txn.origin()) == UpdateOrigin::Local {
                        return;
                    }
                    let target = event.target();
                    let mut update = ConfigUpdate::default();
                    for (key, change) in event.keys(txn) {
                        match key.as_ref() {
                            FONT_KEY => {
                                update.font = Some(match change {
                                    EntryChange::Removed(_) => None,
                                    _ => read_string(target.get(txn, FONT_KEY)),
                                });
                            }
                            FONT_SIZE_KEY => update.font_size = read_number(target.get(txn, FONT_SIZE_KEY)),
                            CONTENT_WIDTH_KEY => {
                                update.content_width = read_number(target.get(txn, CONTENT_WIDTH_KEY))
                            }
                            _ => {}
                        }
                    }

                    let update = {
                        let mut current = config.write().unwrap();
                        let update = changed_fields(update, &current);
                        update.apply_to(&mut current);
                        update
                    };
                    if !update.is_empty() {
                        log::debug!("[Session] Mirrored remote config {:?}", update);
                        events.emit(&SessionEvent::ConfigChanged(update));
                    }
                })
            }),
        );
    }

    /// Write local config changes into the shared config map.
    pub fn set_config(&self, update: &ConfigUpdate) {
        update.apply_to(&mut self.config.write().unwrap());
        let mut txn = self.doc.transact_mut_with(self.local_origin());
        match &update.font {
            Some(Some(font)) => {
                self.config_map.insert(&mut txn, FONT_KEY, font.as_str());
            }
            Some(None) => {
                self.config_map.remove(&mut txn, FONT_KEY);
            }
            None => {}
        }
        if let Some(size) = update.font_size {
            self.config_map.insert(&mut txn, FONT_SIZE_KEY, size);
        }
        if let Some(width) = update.content_width {
            self.config_map.insert(&mut txn, CONTENT_WIDTH_KEY, width);
        }
    }

    // ==================== Undo ====================

    /// Undo the last local change. Returns `true` if anything was undone.
    pub fn undo(&self) -> bool {
        self.with_undo(|undo| undo.undo_blocking())
    }

    /// Redo the last undone change. Returns `true` if anything was redone.
    pub fn redo(&self) -> bool {
        self.with_undo(|undo| undo.redo_blocking())
    }

    /// Whether there is anything to undo.
    pub fn can_undo(&self) -> bool {
        self.undo.lock().unwrap().can_undo()
    }

    /// Whether there is anything to redo.
    pub fn can_redo(&self) -> bool {
        self.undo.lock().unwrap().can_redo()
    }

    /// Close the current undo step; the next local edit starts a new one
    /// instead of merging into it.
    pub fn new_undo_step(&self) {
        self.undo.lock().unwrap().reset();
    }

    fn with_undo(&self, f: impl FnOnce(&mut UndoManager) -> bool) -> bool {
        let mut undo = self.undo.lock().unwrap();
        self.undoing.store(true, Ordering::SeqCst);
        let changed = f(&mut undo);
        self.undoing.store(false, Ordering::SeqCst);
        changed
    }

    // ==================== Persistence ====================

    /// Full replica state as a v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Write the replica state into `file`.
    pub fn save_to(&self, file: &mut File) {
        file.ydoc = self.encode_state();
        file.last_modified = now_millis();
    }
}

impl Drop for ReplicatedDocumentSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ReplicatedDocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocumentSession")
            .field("room", &self.room)
            .field("kind", &self.kind)
            .field("replica", &self.replica)
            .field("status", &self.status())
            .finish()
    }
}

fn read_string(value: Option<Out>) -> Option<String> {
    match value {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn read_number(value: Option<Out>) -> Option<f64> {
    match value {
        Some(Out::Any(Any::Number(n))) => Some(n),
        Some(Out::Any(Any::BigInt(n))) => Some(n as f64),
        _ => None,
    }
}

/// Keep only the fields that differ from `current`.
fn changed_fields(update: ConfigUpdate, current: &Config) -> ConfigUpdate {
    ConfigUpdate {
        font: update.font.filter(|font| *font != current.font),
        font_size: update.font_size.filter(|size| *size != current.font_size),
        content_width: update
            .content_width
            .filter(|width| *width != current.content_width),
    }
}

/// Holds the one live session of the application.
///
/// Opening a document closes the previous session (observers first) before
/// the next one is constructed.
#[derive(Debug, Default)]
pub struct SessionSlot {
    current: Mutex<Option<Arc<ReplicatedDocumentSession>>>,
}

impl SessionSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the current session and install the one built by `build`.
    ///
    /// Fails with [`CollabError::SessionAlreadyLive`] if `room` already has
    /// the live session; close it first to reopen.
    pub fn open(
        &self,
        room: &str,
        build: impl FnOnce() -> Result<ReplicatedDocumentSession>,
    ) -> Result<Arc<ReplicatedDocumentSession>> {
        let mut current = self.current.lock().unwrap();
        if let Some(live) = current.as_ref()
            && !live.is_closed()
            && live.room() == room
        {
            return Err(CollabError::SessionAlreadyLive(room.to_string()));
        }
        if let Some(previous) = current.take() {
            previous.close();
        }
        let session = Arc::new(build()?);
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// The live session, if any.
    pub fn current(&self) -> Option<Arc<ReplicatedDocumentSession>> {
        self.current.lock().unwrap().clone()
    }

    /// Close and forget the live session.
    pub fn close(&self) {
        if let Some(session) = self.current.lock().unwrap().take() {
            session.close();
        }
    }
}
