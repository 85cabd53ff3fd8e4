//! Bidirectional bridge between shared content and an editing view.
//!
//! An [`EditorBinding`] keeps one [`EditorView`] in step with one shared
//! type of a session's replica:
//!
//! - Local edits are pulled from the view with [`EditorBinding::apply_local_edit`]
//!   and written as minimal diffs under the session's local origin tag.
//! - Remote changes reach the view as [`ViewTransaction`]s through a replica
//!   observer that ignores the local tag. Undo/redo replays are dispatched
//!   with `mark_dirty == false`.
//! - A past [`Snapshot`] can be projected read-only without touching the live
//!   replica ([`BindingMode::SnapshotView`]).

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::{Encoder, EncoderV1};
use yrs::{
    DeepObservable, Doc, GetString, Observable, Origin, ReadTxn, Snapshot, TextRef, Transact,
    TransactionMut, Update, XmlFragmentRef,
};

use super::content::{self, DocNode};
use super::observers::{ObserverId, ObserverRegistry};
use super::session::ReplicatedDocumentSession;
use super::types::{OriginClassifier, UpdateOrigin};
use crate::error::{CollabError, Result};
use crate::presence::PresenceChannel;

/// Presence field holding the local cursor.
pub const CURSOR_FIELD: &str = "cursor";

/// Document as an editing view holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "doc", rename_all = "lowercase")]
pub enum ViewDocument {
    /// Structured rich text
    Rich(DocNode),
    /// Plain code text
    Code(String),
}

impl ViewDocument {
    fn describe(&self) -> &'static str {
        match self {
            ViewDocument::Rich(_) => "rich-text",
            ViewDocument::Code(_) => "code",
        }
    }
}

/// Why a transaction is dispatched into the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeSource {
    /// Written by this replica
    Local,
    /// Received from a peer (or loaded from storage)
    Remote,
    /// Replayed by undo/redo
    UndoRedo,
    /// Entering or leaving a snapshot projection
    Snapshot,
    /// A version was applied to the live document
    Restore,
}

/// Side-effect flags of a view transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    /// Where the change came from
    pub source: ChangeSource,
    /// Record in the view's own history
    pub add_to_history: bool,
    /// Flag the document as having unsaved changes
    pub mark_dirty: bool,
    /// Whether the view accepts edits after this transaction
    pub editable: bool,
}

impl TransactionMeta {
    /// Meta for a change of the given source.
    pub fn for_source(source: ChangeSource) -> Self {
        match source {
            ChangeSource::Local => Self {
                source,
                add_to_history: true,
                mark_dirty: true,
                editable: true,
            },
            ChangeSource::Remote => Self {
                source,
                add_to_history: false,
                mark_dirty: true,
                editable: true,
            },
            ChangeSource::UndoRedo | ChangeSource::Snapshot => Self {
                source,
                add_to_history: false,
                mark_dirty: false,
                editable: true,
            },
            ChangeSource::Restore => Self {
                source,
                add_to_history: true,
                mark_dirty: true,
                editable: true,
            },
        }
    }
}

/// Replace the view's document.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewTransaction {
    /// New document
    pub doc: ViewDocument,
    /// Side-effect flags
    pub meta: TransactionMeta,
}

/// Cursor/selection of a view, as character positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Fixed end
    pub anchor: u32,
    /// Moving end
    pub head: u32,
}

/// The editing-view collaborator.
pub trait EditorView: Send + Sync {
    /// Current document.
    fn document(&self) -> ViewDocument;

    /// Current selection, if the view has focus.
    fn selection(&self) -> Option<Selection> {
        None
    }

    /// Apply a transaction. Views reject documents they cannot represent
    /// with [`CollabError::MalformedRemoteUpdate`].
    fn dispatch(&self, tr: ViewTransaction) -> Result<()>;
}

/// Which shared type of the replica a binding targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SharedContent {
    /// Rich-text XML fragment
    Fragment(String),
    /// Code text
    Text(String),
}

impl SharedContent {
    /// Shared name.
    pub fn name(&self) -> &str {
        match self {
            SharedContent::Fragment(name) | SharedContent::Text(name) => name,
        }
    }

    pub(crate) fn resolve(&self, doc: &Doc) -> SharedRef {
        match self {
            SharedContent::Fragment(name) => SharedRef::Fragment(doc.get_or_insert_xml_fragment(name.as_str())),
            SharedContent::Text(name) => SharedRef::Text(doc.get_or_insert_text(name.as_str())),
        }
    }

    /// Materialize the content of `doc` as it was at `snapshot`.
    ///
    /// The live replica is only read. `doc` must keep deleted content
    /// (`skip_gc`), which every session replica does.
    pub fn materialize_at(&self, doc: &Doc, snapshot: &Snapshot) -> Result<ViewDocument> {
        let mut encoder = EncoderV1::new();
        doc.transact()
            .encode_state_from_snapshot(snapshot, &mut encoder)
            .map_err(|e| CollabError::Crdt(format!("Failed to encode snapshot state: {}", e)))?;
        let update = Update::decode_v1(&encoder.to_vec())
            .map_err(|e| CollabError::Crdt(format!("Failed to decode snapshot state: {}", e)))?;

        let past = Doc::new();
        let shared = self.resolve(&past);
        past.transact_mut()
            .apply_update(update)
            .map_err(|e| CollabError::Crdt(format!("Failed to rebuild snapshot state: {}", e)))?;
        let txn = past.transact();
        shared.read(&txn)
    }
}

/// A resolved shared type.
#[derive(Clone)]
pub(crate) enum SharedRef {
    Fragment(XmlFragmentRef),
    Text(TextRef),
}

impl SharedRef {
    pub(crate) fn read<T: ReadTxn>(&self, txn: &T) -> Result<ViewDocument> {
        match self {
            SharedRef::Fragment(fragment) => Ok(ViewDocument::Rich(
                content::read_fragment(txn, fragment)?.normalized(),
            )),
            SharedRef::Text(text) => Ok(ViewDocument::Code(text.get_string(txn))),
        }
    }

    /// Minimal-diff write. Returns `true` if anything changed.
    pub(crate) fn write(&self, txn: &mut TransactionMut, doc: &ViewDocument) -> Result<bool> {
        match (self, doc) {
            (SharedRef::Fragment(fragment), ViewDocument::Rich(node)) => {
                Ok(content::write_fragment(txn, fragment, node))
            }
            (SharedRef::Text(text), ViewDocument::Code(code)) => Ok(content::write_text(txn, text, code)),
            (shared, doc) => Err(shared.mismatch(doc)),
        }
    }

    /// Replace the whole content.
    pub(crate) fn replace(&self, txn: &mut TransactionMut, doc: &ViewDocument) -> Result<()> {
        match (self, doc) {
            (SharedRef::Fragment(fragment), ViewDocument::Rich(node)) => {
                content::replace_fragment(txn, fragment, node);
                Ok(())
            }
            (SharedRef::Text(text), ViewDocument::Code(code)) => {
                use yrs::Text;
                let len = text.len(txn);
                if len > 0 {
                    text.remove_range(txn, 0, len);
                }
                text.insert(txn, 0, code);
                Ok(())
            }
            (shared, doc) => Err(shared.mismatch(doc)),
        }
    }

    fn mismatch(&self, doc: &ViewDocument) -> CollabError {
        let target = match self {
            SharedRef::Fragment(_) => "fragment",
            SharedRef::Text(_) => "text",
        };
        CollabError::Crdt(format!("A {} document cannot be written to shared {}", doc.describe(), target))
    }
}

/// Projection state of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    /// The view edits the live replica
    Live,
    /// The view shows a past snapshot read-only
    SnapshotView,
}

/// Keeps one editing view in sync with one shared type.
pub struct EditorBinding {
    doc: Doc,
    origin: Origin,
    content: SharedContent,
    shared: SharedRef,
    view: Arc<dyn EditorView>,
    presence: Arc<PresenceChannel>,
    observers: Arc<ObserverRegistry>,
    observer: Mutex<Option<ObserverId>>,
    mode: Arc<Mutex<BindingMode>>,
    snapshot: Mutex<Option<Snapshot>>,
}

impl EditorBinding {
    /// Bind `view` to `content` of the session's replica.
    ///
    /// The view receives the current replica content if it differs from what
    /// it shows.
    pub fn bind(
        session: &ReplicatedDocumentSession,
        view: Arc<dyn EditorView>,
        content: SharedContent,
    ) -> Result<Self> {
        let doc = session.doc().clone();
        let shared = content.resolve(&doc);
        let mode = Arc::new(Mutex::new(BindingMode::Live));

        let binding = Self {
            doc,
            origin: session.local_origin(),
            content,
            shared,
            view,
            presence: Arc::clone(session.presence()),
            observers: Arc::clone(session.observers()),
            observer: Mutex::new(None),
            mode,
            snapshot: Mutex::new(None),
        };

        let current = binding.live_document()?;
        if current != binding.view.document() {
            binding.view.dispatch(ViewTransaction {
                doc: current,
                meta: TransactionMeta {
                    mark_dirty: false,
                    ..TransactionMeta::for_source(ChangeSource::Remote)
                },
            })?;
        }

        let id = binding.register_observer(session.classifier());
        *binding.observer.lock().unwrap() = Some(id);
        log::debug!("[Binding] Bound view to {:?}", binding.content);
        Ok(binding)
    }

    fn register_observer(&self, classifier: OriginClassifier) -> ObserverId {
        let shared = self.shared.clone();
        let view = Arc::clone(&self.view);
        let mode = Arc::clone(&self.mode);

        let arm: super::observers::ArmFn = match &self.shared {
            SharedRef::Fragment(fragment) => {
                let fragment = fragment.clone();
                Box::new(move || {
                    let (shared, view, mode, classifier) =
                        (shared.clone(), Arc::clone(&view), Arc::clone(&mode), classifier.clone());
                    fragment.observe_deep(move |txn, _events| {
                        forward_remote(txn, &shared, view.as_ref(), &mode, &classifier);
                    })
                })
            }
            SharedRef::Text(text) => {
                let text = text.clone();
                Box::new(move || {
                    let (shared, view, mode, classifier) =
                        (shared.clone(), Arc::clone(&view), Arc::clone(&mode), classifier.clone());
                    text.observe(move |txn, _event| {
                        forward_remote(txn, &shared, view.as_ref(), &mode, &classifier);
                    })
                })
            }
        };
        self.observers.register("editor-binding", arm)
    }

    /// Shared content this binding targets.
    pub fn content(&self) -> &SharedContent {
        &self.content
    }

    /// Current projection mode.
    pub fn mode(&self) -> BindingMode {
        *self.mode.lock().unwrap()
    }

    /// Snapshot currently projected, if any.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    /// Live replica content.
    pub fn live_document(&self) -> Result<ViewDocument> {
        let txn = self.doc.transact();
        self.shared.read(&txn)
    }

    /// Write the view's current document into the replica as a local edit.
    ///
    /// Returns `true` if the replica changed. Does nothing while a snapshot
    /// is projected.
    pub fn apply_local_edit(&self) -> Result<bool> {
        if self.mode() == BindingMode::SnapshotView {
            return Ok(false);
        }
        let doc = self.view.document();
        let mut txn = self.doc.transact_mut_with(self.origin.clone());
        self.shared.write(&mut txn, &doc)
    }

    /// One-time import of a non-collaborative document.
    ///
    /// The fragment is replaced only when the parsed document differs
    /// structurally from its current content. Returns `true` if it was
    /// replaced.
    pub fn import_document(&self, json: &serde_json::Value) -> Result<bool> {
        let incoming = match &self.shared {
            SharedRef::Fragment(_) => ViewDocument::Rich(DocNode::from_json(json)?.normalized()),
            SharedRef::Text(_) => match json {
                serde_json::Value::String(code) => ViewDocument::Code(code.clone()),
                other => ViewDocument::Rich(DocNode::from_json(other)?),
            },
        };

        if incoming == self.live_document()? {
            log::debug!("[Binding] Import of {} skipped: content is equal", self.content.name());
            return Ok(false);
        }

        {
            let mut txn = self.doc.transact_mut_with(self.origin.clone());
            self.shared.replace(&mut txn, &incoming)?;
        }
        log::info!("[Binding] Imported document into {}", self.content.name());
        self.view.dispatch(ViewTransaction {
            doc: incoming,
            meta: TransactionMeta {
                add_to_history: false,
                mark_dirty: false,
                ..TransactionMeta::for_source(ChangeSource::Local)
            },
        })?;
        Ok(true)
    }

    /// Project `snapshot` into the view, read-only. The live replica is not modified.
    pub fn render_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let past = self.content.materialize_at(&self.doc, snapshot)?;
        *self.mode.lock().unwrap() = BindingMode::SnapshotView;
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        self.view.dispatch(ViewTransaction {
            doc: past,
            meta: TransactionMeta {
                editable: false,
                ..TransactionMeta::for_source(ChangeSource::Snapshot)
            },
        })
    }

    /// Leave the snapshot projection and show the live content again.
    pub fn clear_snapshot(&self) -> Result<()> {
        if self.mode() == BindingMode::Live {
            return Ok(());
        }
        *self.mode.lock().unwrap() = BindingMode::Live;
        self.snapshot.lock().unwrap().take();
        let live = self.live_document()?;
        self.view.dispatch(ViewTransaction {
            doc: live,
            meta: TransactionMeta::for_source(ChangeSource::Snapshot),
        })
    }

    /// Replace the live content with `doc` as one local, undoable edit and
    /// return to live editing.
    pub fn restore(&self, doc: ViewDocument) -> Result<()> {
        {
            let mut txn = self.doc.transact_mut_with(self.origin.clone());
            self.shared.replace(&mut txn, &doc)?;
        }
        *self.mode.lock().unwrap() = BindingMode::Live;
        self.snapshot.lock().unwrap().take();
        self.view.dispatch(ViewTransaction {
            doc,
            meta: TransactionMeta::for_source(ChangeSource::Restore),
        })
    }

    /// Publish the view's selection as the local cursor.
    pub fn publish_cursor(&self) {
        let value = match self.view.selection() {
            Some(selection) => serde_json::json!({
                "content": self.content.name(),
                "anchor": selection.anchor,
                "head": selection.head,
            }),
            None => serde_json::Value::Null,
        };
        if self.presence.local_state().is_some() {
            self.presence.set_local_state_field(CURSOR_FIELD, value);
        }
    }

    /// Stop forwarding replica changes to the view.
    pub fn unbind(&self) {
        if let Some(id) = self.observer.lock().unwrap().take() {
            self.observers.unregister(id);
            log::debug!("[Binding] Unbound view from {:?}", self.content);
        }
    }

    /// Whether the replica observer is currently subscribed.
    pub fn is_observing(&self) -> bool {
        self.observer
            .lock()
            .unwrap()
            .is_some_and(|id| self.observers.is_active(id))
    }
}

impl Drop for EditorBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Observer body: translate a non-local change into a view transaction.
fn forward_remote(
    txn: &TransactionMut,
    shared: &SharedRef,
    view: &dyn EditorView,
    mode: &Mutex<BindingMode>,
    classifier: &OriginClassifier,
) {
    let source = match classifier.classify(txn.origin()) {
        UpdateOrigin::Local => return,
        UpdateOrigin::UndoRedo => ChangeSource::UndoRedo,
        UpdateOrigin::Remote | UpdateOrigin::Load => ChangeSource::Remote,
    };
    if *mode.lock().unwrap() == BindingMode::SnapshotView {
        // Shown once the projection is cleared
        return;
    }

    let doc = match shared.read(txn) {
        Ok(doc) => doc,
        Err(e) => {
            log::warn!("[Binding] Dropping untranslatable remote change: {}", e);
            return;
        }
    };
    if let Err(e) = view.dispatch(ViewTransaction {
        doc,
        meta: TransactionMeta::for_source(source),
    }) {
        log::warn!("[Binding] View rejected remote change: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::session::RoomKind;
    use crate::test_utils::{RecordingView, session_context};
    use crate::transport::MemoryHub;
    use serde_json::json;

    fn rich(paragraphs: &[&str]) -> ViewDocument {
        ViewDocument::Rich(DocNode::doc(
            paragraphs.iter().map(|p| DocNode::paragraph(p)).collect(),
        ))
    }

    fn session(hub: &MemoryHub, room: &str) -> ReplicatedDocumentSession {
        ReplicatedDocumentSession::create(room, RoomKind::Editor, false, &session_context(hub)).unwrap()
    }

    #[test]
    fn test_local_edit_is_not_echoed() {
        let hub = MemoryHub::new();
        let session = session(&hub, "doc");
        let view = Arc::new(RecordingView::new(rich(&[])));
        let binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();

        view.set_document(rich(&["hello"]));
        assert!(binding.apply_local_edit().unwrap());
        assert!(!binding.apply_local_edit().unwrap());
        assert!(view.dispatched().is_empty());
        assert_eq!(binding.live_document().unwrap(), rich(&["hello"]));
    }

    #[test]
    fn test_remote_change_reaches_view() {
        let hub = MemoryHub::new();
        let session = session(&hub, "doc");
        let view = Arc::new(RecordingView::new(rich(&[])));
        let _binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();

        // A write tagged with another origin stands in for a network update
        let fragment = session.doc().get_or_insert_xml_fragment("doc");
        {
            let mut txn = session.doc().transact_mut_with(Origin::from("peer"));
            content::write_fragment(&mut txn, &fragment, &DocNode::doc(vec![DocNode::paragraph("remote")]));
        }

        let dispatched = view.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].doc, rich(&["remote"]));
        assert_eq!(dispatched[0].meta.source, ChangeSource::Remote);
        assert!(!dispatched[0].meta.add_to_history);
    }

    #[test]
    fn test_undo_is_dispatched_without_marking_dirty() {
        let hub = MemoryHub::new();
        let session = session(&hub, "doc");
        let view = Arc::new(RecordingView::new(rich(&[])));
        let binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();

        view.set_document(rich(&["typed"]));
        binding.apply_local_edit().unwrap();
        assert!(session.undo());

        let last = view.dispatched().pop().unwrap();
        assert_eq!(last.meta.source, ChangeSource::UndoRedo);
        assert!(!last.meta.mark_dirty);
        assert_eq!(last.doc, rich(&[]));
    }

    #[test]
    fn test_import_skips_equal_content() {
        let hub = MemoryHub::new();
        let session = session(&hub, "doc");
        let view = Arc::new(RecordingView::new(rich(&[])));
        let binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();

        let legacy = json!({
            "type": "doc",
            "content": [{ "type": "paragraph", "content": [{ "type": "text", "text": "legacy" }] }]
        });
        assert!(binding.import_document(&legacy).unwrap());
        let state = session.encode_state();

        assert!(!binding.import_document(&legacy).unwrap());
        assert_eq!(session.encode_state(), state);
    }

    #[test]
    fn test_snapshot_projection_is_read_only() {
        let hub = MemoryHub::new();
        let session = session(&hub, "doc");
        let view = Arc::new(RecordingView::new(rich(&[])));
        let binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();

        view.set_document(rich(&["v1"]));
        binding.apply_local_edit().unwrap();
        let snapshot = session.doc().transact().snapshot();
        view.set_document(rich(&["v2"]));
        binding.apply_local_edit().unwrap();
        let before = session.encode_state();

        binding.render_snapshot(&snapshot).unwrap();
        assert_eq!(binding.mode(), BindingMode::SnapshotView);
        let shown = view.dispatched().pop().unwrap();
        assert_eq!(shown.doc, rich(&["v1"]));
        assert!(!shown.meta.editable);

        // Local edits are ignored while projecting
        view.set_document(rich(&["ignored"]));
        assert!(!binding.apply_local_edit().unwrap());

        binding.clear_snapshot().unwrap();
        assert_eq!(binding.mode(), BindingMode::Live);
        assert!(binding.snapshot().is_none());
        assert_eq!(view.dispatched().pop().unwrap().doc, rich(&["v2"]));
        assert_eq!(session.encode_state(), before);
    }

    #[test]
    fn test_code_text_binding() {
        let hub = MemoryHub::new();
        let session =
            ReplicatedDocumentSession::create("code", RoomKind::Code, false, &session_context(&hub)).unwrap();
        let view = Arc::new(RecordingView::new(ViewDocument::Code(String::new())));
        let binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Text("code".into())).unwrap();

        view.set_document(ViewDocument::Code("let x = 1;".into()));
        assert!(binding.apply_local_edit().unwrap());
        assert_eq!(
            binding.live_document().unwrap(),
            ViewDocument::Code("let x = 1;".into())
        );

        view.set_document(rich(&["wrong kind"]));
        assert!(matches!(binding.apply_local_edit(), Err(CollabError::Crdt(_))));
    }

    #[test]
    fn test_unbind_and_stop_remove_observer() {
        let hub = MemoryHub::new();
        let session = session(&hub, "doc");
        let view = Arc::new(RecordingView::new(rich(&[])));
        let binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();
        assert!(binding.is_observing());

        session.start().unwrap();
        session.stop();
        assert!(!binding.is_observing());

        // Only the session's own config observer is left
        binding.unbind();
        assert_eq!(session.observers().len(), 1);
    }

    #[test]
    fn test_rejected_remote_change_is_dropped() {
        let hub = MemoryHub::new();
        let session = session(&hub, "doc");
        let view = Arc::new(RecordingView::new(rich(&[])));
        let _binding =
            EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();
        view.reject_dispatch(true);

        let fragment = session.doc().get_or_insert_xml_fragment("doc");
        {
            let mut txn = session.doc().transact_mut_with(Origin::from("peer"));
            content::write_fragment(&mut txn, &fragment, &DocNode::doc(vec![DocNode::paragraph("x")]));
        }
        // The replica keeps the change; the view just did not take it
        assert!(view.dispatched().is_empty());
        assert_eq!(
            ViewDocument::Rich(DocNode::doc(vec![DocNode::paragraph("x")])),
            SharedContent::Fragment("doc".into())
                .resolve(session.doc())
                .read(&session.doc().transact())
                .unwrap()
        );
    }
}
