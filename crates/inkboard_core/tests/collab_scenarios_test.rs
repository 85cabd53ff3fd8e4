//! Integration tests for multi-session collaboration over the in-memory hub

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use inkboard_core::canvas::CanvasState;
use inkboard_core::config::Config;
use inkboard_core::crdt::{
    CanvasElementReplicator, DocNode, EditorBinding, EditorView, ReplicatedDocumentSession,
    RoomKind, SessionContext, SharedContent, SharedRoomIndicator, SnapshotVersioning,
    ViewDocument, ViewTransaction,
};
use inkboard_core::error::{CollabError, Result};
use inkboard_core::model::{Canvas, CanvasElement, EdgeType, EditorElement, LinkElement};
use inkboard_core::presence::PresenceChannel;
use inkboard_core::transport::MemoryHub;
use inkboard_core::tree::{SiblingOrderTree, TreeEntity, TreeNode};
use yrs::{GetString, Transact, XmlFragment, XmlTextPrelim};

fn context(hub: &MemoryHub) -> SessionContext {
    SessionContext {
        transport: Arc::new(hub.clone()),
        presence: Arc::new(PresenceChannel::with_random_user()),
        config: Config::default().into_shared(),
        indicator: Arc::new(SharedRoomIndicator::new()),
        storage: None,
    }
}

fn pump(sessions: &[&ReplicatedDocumentSession]) {
    for _ in 0..6 {
        for session in sessions {
            let _ = session.poll();
        }
    }
}

/// Minimal editing view: shows whatever it was last given.
struct TestView {
    doc: Mutex<ViewDocument>,
}

impl TestView {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            doc: Mutex::new(ViewDocument::Rich(DocNode::doc(vec![]))),
        })
    }

    fn type_text(&self, paragraphs: &[&str]) {
        *self.doc.lock().unwrap() = ViewDocument::Rich(DocNode::doc(
            paragraphs.iter().map(|p| DocNode::paragraph(p)).collect(),
        ));
    }

    fn text(&self) -> String {
        match &*self.doc.lock().unwrap() {
            ViewDocument::Rich(node) => node.text_content(),
            ViewDocument::Code(code) => code.clone(),
        }
    }
}

impl EditorView for TestView {
    fn document(&self) -> ViewDocument {
        self.doc.lock().unwrap().clone()
    }

    fn dispatch(&self, tr: ViewTransaction) -> Result<()> {
        *self.doc.lock().unwrap() = tr.doc;
        Ok(())
    }
}

fn editor(id: &str) -> CanvasElement {
    CanvasElement::Editor(EditorElement {
        id: id.into(),
        width: 300.0,
        height: 200.0,
        ..Default::default()
    })
}

fn link(id: &str, from: &str, to: &str) -> CanvasElement {
    CanvasElement::Link(LinkElement {
        id: id.into(),
        from: from.into(),
        from_edge: Some(EdgeType::Right),
        to: Some(to.into()),
        to_edge: Some(EdgeType::Left),
        ..Default::default()
    })
}

fn id_set(canvas: &CanvasState) -> BTreeSet<String> {
    canvas.element_ids().into_iter().collect()
}

fn empty_canvas(id: &str) -> CanvasState {
    CanvasState::new(Canvas {
        id: id.into(),
        ..Canvas::new()
    })
}

/// Local add: the owner appends, the replicator publishes.
fn add(canvas: &CanvasState, replicator: &CanvasElementReplicator, element: CanvasElement) {
    canvas.add_element(element.clone());
    replicator.add_element(&element).unwrap();
}

#[test]
fn test_two_sessions_share_fragment() {
    let hub = MemoryHub::new();
    let s1 = ReplicatedDocumentSession::create("abc", RoomKind::Editor, true, &context(&hub)).unwrap();
    let s2 = ReplicatedDocumentSession::create("abc", RoomKind::Editor, true, &context(&hub)).unwrap();
    let view = TestView::new();
    let _binding = EditorBinding::bind(&s2, view.clone(), SharedContent::Fragment("abc".into())).unwrap();
    pump(&[&s1, &s2]);

    let fragment = s1.doc().get_or_insert_xml_fragment("abc");
    {
        let mut txn = s1.doc().transact_mut_with(s1.local_origin());
        fragment.insert(&mut txn, 0, XmlTextPrelim::new("hello"));
    }
    pump(&[&s1, &s2]);

    let remote = s2.doc().get_or_insert_xml_fragment("abc");
    assert_eq!(remote.get_string(&s2.doc().transact()), "hello");
    assert_eq!(view.text(), "hello");
}

#[test]
fn test_bound_views_converge() {
    let hub = MemoryHub::new();
    let s1 = ReplicatedDocumentSession::create("doc", RoomKind::Editor, true, &context(&hub)).unwrap();
    let s2 = ReplicatedDocumentSession::create("doc", RoomKind::Editor, true, &context(&hub)).unwrap();
    let v1 = TestView::new();
    let v2 = TestView::new();
    let b1 = EditorBinding::bind(&s1, v1.clone(), SharedContent::Fragment("doc".into())).unwrap();
    let b2 = EditorBinding::bind(&s2, v2.clone(), SharedContent::Fragment("doc".into())).unwrap();
    pump(&[&s1, &s2]);

    v1.type_text(&["first"]);
    b1.apply_local_edit().unwrap();
    pump(&[&s1, &s2]);
    assert_eq!(v2.text(), "first");

    v2.type_text(&["first", "second"]);
    b2.apply_local_edit().unwrap();
    pump(&[&s1, &s2]);
    assert_eq!(v1.text(), "first\nsecond");
}

#[test]
fn test_sibling_order_scenario() {
    let file = |id: &str, parent: Option<&str>, left: Option<&str>| {
        TreeEntity::File(inkboard_core::model::File {
            id: id.into(),
            parent_id: parent.map(String::from),
            left_id: left.map(String::from),
            ..Default::default()
        })
    };
    let mut tree = SiblingOrderTree::new(vec![
        file("P", None, None),
        file("B", Some("P"), Some("A")),
        file("C", Some("P"), Some("B")),
        file("A", Some("P"), None),
    ]);
    let order = |tree: &SiblingOrderTree| -> Vec<String> {
        tree.node("P")
            .unwrap()
            .children
            .iter()
            .map(|node: &TreeNode| node.id().to_string())
            .collect()
    };
    assert_eq!(order(&tree), vec!["A", "B", "C"]);

    tree.move_to("C", Some("P"), None).unwrap();
    assert_eq!(order(&tree), vec!["C", "A", "B"]);
}

#[test]
fn test_cascade_removal_replicates() {
    let hub = MemoryHub::new();
    let s1 = ReplicatedDocumentSession::create("c1", RoomKind::Canvas, true, &context(&hub)).unwrap();
    let s2 = ReplicatedDocumentSession::create("c1", RoomKind::Canvas, true, &context(&hub)).unwrap();
    let c1 = empty_canvas("c1");
    let c2 = empty_canvas("c1");
    let r1 = CanvasElementReplicator::attach(&s1, &c1).unwrap();
    let _r2 = CanvasElementReplicator::attach(&s2, &c2).unwrap();
    pump(&[&s1, &s2]);

    add(&c1, &r1, editor("E1"));
    add(&c1, &r1, editor("E2"));
    add(&c1, &r1, link("L", "E1", "E2"));
    pump(&[&s1, &s2]);
    assert_eq!(id_set(&c2), id_set(&c1));

    let removed = c1.remove_elements(&["E2".to_string()]);
    assert_eq!(removed, vec!["E2", "L"]);
    r1.remove_many(&removed);
    pump(&[&s1, &s2]);

    assert_eq!(c1.element_ids(), vec!["E1"]);
    assert_eq!(c2.element_ids(), vec!["E1"]);
}

#[test]
fn test_concurrent_canvas_edits_converge_as_sets() {
    let hub = MemoryHub::new();
    let s1 = ReplicatedDocumentSession::create("c1", RoomKind::Canvas, true, &context(&hub)).unwrap();
    let s2 = ReplicatedDocumentSession::create("c1", RoomKind::Canvas, true, &context(&hub)).unwrap();
    let c1 = empty_canvas("c1");
    let c2 = empty_canvas("c1");
    let r1 = CanvasElementReplicator::attach(&s1, &c1).unwrap();
    let r2 = CanvasElementReplicator::attach(&s2, &c2).unwrap();
    pump(&[&s1, &s2]);

    // Interleaved without pumping in between
    add(&c1, &r1, editor("A"));
    add(&c2, &r2, editor("B"));
    add(&c1, &r1, editor("C"));
    add(&c2, &r2, link("L", "B", "A"));
    pump(&[&s1, &s2]);

    let expected: BTreeSet<String> = ["A", "B", "C", "L"].iter().map(|s| s.to_string()).collect();
    assert_eq!(id_set(&c1), expected);
    assert_eq!(id_set(&c2), expected);
}

#[test]
fn test_offline_canvas_materializes_on_attach() {
    let hub = MemoryHub::new();
    let s1 = ReplicatedDocumentSession::create("c1", RoomKind::Canvas, true, &context(&hub)).unwrap();
    let c1 = CanvasState::new(Canvas {
        id: "c1".into(),
        elements: vec![editor("E1"), editor("E2")],
        ..Canvas::new()
    });
    let _r1 = CanvasElementReplicator::attach(&s1, &c1).unwrap();

    // A peer that joins later receives everything through the handshake
    let s2 = ReplicatedDocumentSession::create("c1", RoomKind::Canvas, true, &context(&hub)).unwrap();
    pump(&[&s1, &s2]);
    let c2 = empty_canvas("c1");
    let _r2 = CanvasElementReplicator::attach(&s2, &c2).unwrap();
    assert_eq!(id_set(&c2), id_set(&c1));
}

#[test]
fn test_version_dedupe() {
    let hub = MemoryHub::new();
    let session = ReplicatedDocumentSession::create("doc", RoomKind::Editor, false, &context(&hub)).unwrap();
    let view = TestView::new();
    let binding = EditorBinding::bind(&session, view.clone(), SharedContent::Fragment("doc".into())).unwrap();
    let versions = SnapshotVersioning::new(&session, SharedContent::Fragment("doc".into()));

    view.type_text(&["draft"]);
    binding.apply_local_edit().unwrap();
    versions.add_version().unwrap();
    let count = versions.versions().len();
    versions.add_version().unwrap();
    assert_eq!(versions.versions().len(), count);

    // A reverted edit still moved the document's history on
    view.type_text(&["scratch"]);
    binding.apply_local_edit().unwrap();
    view.type_text(&["draft"]);
    binding.apply_local_edit().unwrap();
    assert!(versions.add_version().unwrap().is_some());
    assert_eq!(versions.versions().len(), count + 1);
}

#[test]
fn test_versions_replicate() {
    let hub = MemoryHub::new();
    let s1 = ReplicatedDocumentSession::create("doc", RoomKind::Editor, true, &context(&hub)).unwrap();
    let s2 = ReplicatedDocumentSession::create("doc", RoomKind::Editor, true, &context(&hub)).unwrap();
    let view = TestView::new();
    let binding = EditorBinding::bind(&s1, view.clone(), SharedContent::Fragment("doc".into())).unwrap();
    pump(&[&s1, &s2]);

    view.type_text(&["shared history"]);
    binding.apply_local_edit().unwrap();
    let version = SnapshotVersioning::new(&s1, SharedContent::Fragment("doc".into()))
        .add_version()
        .unwrap()
        .unwrap();
    pump(&[&s1, &s2]);

    let remote = SnapshotVersioning::new(&s2, SharedContent::Fragment("doc".into()));
    assert_eq!(remote.versions(), vec![version.clone()]);
    assert_eq!(
        remote.content_at(&version).unwrap(),
        ViewDocument::Rich(DocNode::doc(vec![DocNode::paragraph("shared history")]))
    );
    // Nothing changed on the peer since the replicated version was stored
    assert!(remote.add_version().unwrap().is_none());
}

#[test]
fn test_connection_loss_is_not_retried() {
    let hub = MemoryHub::new();
    let s1 = ReplicatedDocumentSession::create("abc", RoomKind::Editor, true, &context(&hub)).unwrap();
    pump(&[&s1]);
    assert!(s1.is_started());

    hub.drop_room("editor/abc");
    assert!(matches!(s1.poll(), Err(CollabError::Transport(_))));
    let status = s1.status();
    assert!(!status.started);
    assert!(status.error.is_some());

    // Nothing reconnects on its own
    pump(&[&s1]);
    assert!(!s1.is_started());
    assert_eq!(hub.peer_count("editor/abc"), 0);
}
