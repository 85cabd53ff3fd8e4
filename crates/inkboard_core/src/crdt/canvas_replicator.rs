//! Replication of a canvas's element array.
//!
//! Each canvas has a shared map named after the canvas id. Every element is
//! one entry keyed `el:{id}` holding a nested map of the element's
//! serializable fields. The map has no order: local append order decides
//! display order, and peers only converge on the element *set*.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::{Map as JsonMap, Value};
use yrs::types::{EntryChange, Event, PathSegment};
use yrs::{Any, DeepObservable, Doc, Map, MapPrelim, MapRef, Origin, Out, ReadTxn, Transact, TransactionMut};

use super::observers::{ObserverId, ObserverRegistry};
use super::session::ReplicatedDocumentSession;
use super::types::{OriginClassifier, UpdateOrigin};
use crate::canvas::CanvasState;
use crate::error::{CollabError, Result};
use crate::model::CanvasElement;

/// Prefix of element keys in the shared map.
pub const ELEMENT_KEY_PREFIX: &str = "el:";

/// Shared-map key of an element.
pub fn element_key(id: &str) -> String {
    format!("{}{}", ELEMENT_KEY_PREFIX, id)
}

/// Element id of a shared-map key, `None` for keys that are not element keys.
pub fn element_id(key: &str) -> Option<&str> {
    key.strip_prefix(ELEMENT_KEY_PREFIX).filter(|id| !id.is_empty())
}

/// Keeps a [`CanvasState`] and its shared element map in correspondence.
pub struct CanvasElementReplicator {
    doc: Doc,
    origin: Origin,
    map: MapRef,
    canvas: CanvasState,
    observers: Arc<ObserverRegistry>,
    observer: Mutex<Option<ObserverId>>,
}

impl CanvasElementReplicator {
    /// Attach `canvas` to the session's replica.
    ///
    /// Local elements missing from the map are inserted (one local
    /// transaction), map elements missing locally are appended to the canvas,
    /// then the remote-change observer is registered.
    pub fn attach(session: &ReplicatedDocumentSession, canvas: &CanvasState) -> Result<Self> {
        let doc = session.doc().clone();
        let map = doc.get_or_insert_map(canvas.id().as_str());
        let replicator = Self {
            doc,
            origin: session.local_origin(),
            map,
            canvas: canvas.clone(),
            observers: Arc::clone(session.observers()),
            observer: Mutex::new(None),
        };

        let local = canvas.elements();
        {
            let mut txn = replicator.doc.transact_mut_with(replicator.origin.clone());
            for element in &local {
                if replicator.map.get(&txn, &element_key(element.id())).is_none() {
                    insert_element(&mut txn, &replicator.map, element)?;
                }
            }
        }

        let local_ids: HashSet<&str> = local.iter().map(CanvasElement::id).collect();
        let missing = {
            let txn = replicator.doc.transact();
            let mut missing = Vec::new();
            for (key, value) in replicator.map.iter(&txn) {
                let Some(id) = element_id(key) else {
                    log::debug!("[Canvas] Ignoring shared key {}", key);
                    continue;
                };
                if local_ids.contains(id) {
                    continue;
                }
                match read_element_value(&txn, value) {
                    Ok(element) => missing.push(element),
                    Err(e) => log::warn!("[Canvas] Skipping unreadable element {}: {}", id, e),
                }
            }
            missing
        };
        for element in missing {
            canvas.add_element(element);
        }

        let id = replicator.register_observer(session.classifier());
        *replicator.observer.lock().unwrap() = Some(id);
        log::info!(
            "[Canvas] Attached canvas {} ({} elements)",
            canvas.id(),
            canvas.elements().len()
        );
        Ok(replicator)
    }

    fn register_observer(&self, classifier: OriginClassifier) -> ObserverId {
        let map = self.map.clone();
        let canvas = self.canvas.clone();
        self.observers.register(
            "canvas-elements",
            Box::new(move || {
                let canvas = canvas.clone();
                let classifier = classifier.clone();
                map.observe_deep(move |txn, events| {
                    if classifier.classify(txn.origin()) == UpdateOrigin::Local {
                        return;
                    }
                    for event in events.iter() {
                        if let Event::Map(event) = event {
                            apply_map_event(txn, event, &canvas);
                        }
                    }
                })
            }),
        )
    }

    /// Whether the shared map holds `id`.
    pub fn has_element(&self, id: &str) -> bool {
        let txn = self.doc.transact();
        self.map.contains_key(&txn, &element_key(id))
    }

    /// Elements as stored in the shared map, in no particular order.
    pub fn shared_elements(&self) -> Vec<CanvasElement> {
        let txn = self.doc.transact();
        self.map
            .iter(&txn)
            .filter(|(key, _)| element_id(key).is_some())
            .filter_map(|(_, value)| read_element_value(&txn, value).ok())
            .collect()
    }

    /// Publish a new element.
    pub fn add_element(&self, element: &CanvasElement) -> Result<()> {
        self.add_elements(std::slice::from_ref(element))
    }

    /// Publish several elements in one transaction.
    pub fn add_elements(&self, elements: &[CanvasElement]) -> Result<()> {
        let mut txn = self.doc.transact_mut_with(self.origin.clone());
        for element in elements {
            insert_element(&mut txn, &self.map, element)?;
        }
        Ok(())
    }

    /// Publish the changed fields of an element (inserting it if unknown).
    pub fn update_element(&self, element: &CanvasElement) -> Result<()> {
        let fields = element.to_fields()?;
        let key = element_key(element.id());
        let mut txn = self.doc.transact_mut_with(self.origin.clone());

        let nested = match self.map.get(&txn, &key) {
            Some(Out::YMap(nested)) => nested,
            _ => return insert_element(&mut txn, &self.map, element),
        };

        let stale: Vec<String> = nested
            .keys(&txn)
            .filter(|field| !fields.contains_key(*field))
            .map(str::to_string)
            .collect();
        for field in stale {
            nested.remove(&mut txn, &field);
        }
        for (field, value) in fields {
            let value = json_to_any(value);
            let current = match nested.get(&txn, &field) {
                Some(Out::Any(any)) => Some(any),
                _ => None,
            };
            if current.as_ref() != Some(&value) {
                nested.insert(&mut txn, field, value);
            }
        }
        Ok(())
    }

    /// Remove an element from the shared map.
    pub fn remove_element(&self, id: &str) {
        self.remove_many(&[id.to_string()]);
    }

    /// Remove several elements in one transaction.
    pub fn remove_many(&self, ids: &[String]) {
        let mut txn = self.doc.transact_mut_with(self.origin.clone());
        for id in ids {
            self.map.remove(&mut txn, &element_key(id));
        }
    }

    /// Remove every element.
    pub fn remove_all(&self) {
        let mut txn = self.doc.transact_mut_with(self.origin.clone());
        self.map.clear(&mut txn);
    }

    /// Stop applying remote changes to the canvas.
    pub fn detach(&self) {
        if let Some(id) = self.observer.lock().unwrap().take() {
            self.observers.unregister(id);
            log::debug!("[Canvas] Detached canvas {}", self.canvas.id());
        }
    }

    /// Whether the remote-change observer is currently subscribed.
    pub fn is_observing(&self) -> bool {
        self.observer
            .lock()
            .unwrap()
            .is_some_and(|id| self.observers.is_active(id))
    }
}

impl Drop for CanvasElementReplicator {
    fn drop(&mut self) {
        self.detach();
    }
}

fn insert_element(txn: &mut TransactionMut, map: &MapRef, element: &CanvasElement) -> Result<()> {
    let fields = element.to_fields()?;
    let nested = map.insert(txn, element_key(element.id()), MapPrelim::default());
    for (field, value) in fields {
        nested.insert(txn, field, json_to_any(value));
    }
    Ok(())
}

/// Apply one remote map event to the canvas.
fn apply_map_event(txn: &TransactionMut, event: &yrs::types::map::MapEvent, canvas: &CanvasState) {
    let path = event.path();
    match path.front() {
        // Root: whole elements were added, replaced or removed
        None => {
            for (key, change) in event.keys(txn) {
                let Some(id) = element_id(key) else {
                    log::debug!("[Canvas] Ignoring remote change of key {}", key);
                    continue;
                };
                match change {
                    EntryChange::Inserted(value) => match read_element_value(txn, value.clone()) {
                        Ok(element) => canvas.add_element(element),
                        Err(e) => log::warn!("[Canvas] Dropping remote element {}: {}", id, e),
                    },
                    EntryChange::Updated(_, value) => match read_element_value(txn, value.clone()) {
                        Ok(element) if canvas.contains(id) => {
                            if let Err(e) = canvas.update_element(element) {
                                log::warn!("[Canvas] Dropping remote replace of {}: {}", id, e);
                            }
                        }
                        Ok(element) => canvas.add_element(element),
                        Err(e) => log::warn!("[Canvas] Dropping remote replace of {}: {}", id, e),
                    },
                    EntryChange::Removed(_) => {
                        canvas.remove_element(id);
                    }
                }
            }
        }
        // One level down: fields of one element changed
        Some(PathSegment::Key(key)) if path.len() == 1 => {
            let Some(id) = element_id(key) else {
                log::debug!("[Canvas] Ignoring remote change under key {}", key);
                return;
            };
            if !canvas.contains(id) {
                match read_element(txn, event.target()) {
                    Ok(element) => canvas.add_element(element),
                    Err(e) => log::warn!("[Canvas] Dropping remote patch of unknown {}: {}", id, e),
                }
                return;
            }
            for (field, change) in event.keys(txn) {
                let value = match change {
                    EntryChange::Removed(_) => None,
                    EntryChange::Inserted(value) | EntryChange::Updated(_, value) => {
                        Some(out_to_json(value.clone()))
                    }
                };
                if let Err(e) = canvas.patch_element(id, field, value) {
                    log::warn!("[Canvas] Dropping remote patch of {}.{}: {}", id, field, e);
                }
            }
        }
        _ => log::debug!("[Canvas] Ignoring nested change at {:?}", path),
    }
}

fn read_element_value<T: ReadTxn>(txn: &T, value: Out) -> Result<CanvasElement> {
    match value {
        Out::YMap(nested) => read_element(txn, &nested),
        other => Err(CollabError::MalformedRemoteUpdate(format!(
            "element entry is not a map: {:?}",
            other
        ))),
    }
}

fn read_element<T: ReadTxn>(txn: &T, nested: &MapRef) -> Result<CanvasElement> {
    let fields: JsonMap<String, Value> = nested
        .iter(txn)
        .map(|(field, value)| (field.to_string(), out_to_json(value)))
        .collect();
    CanvasElement::from_fields(fields)
        .map_err(|e| CollabError::MalformedRemoteUpdate(format!("invalid element fields: {}", e)))
}

/// JSON value as a shared scalar. Numbers become doubles, as in JavaScript peers.
pub(crate) fn json_to_any(value: Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(b),
        Value::Number(n) => n.as_f64().map(Any::Number).unwrap_or(Any::Null),
        Value::String(s) => Any::String(s.into()),
        Value::Array(items) => Any::Array(items.into_iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(fields) => Any::Map(Arc::new(
            fields
                .into_iter()
                .map(|(k, v)| (k, json_to_any(v)))
                .collect(),
        )),
    }
}

pub(crate) fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::from(bytes.to_vec()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

fn out_to_json(value: Out) -> Value {
    match value {
        Out::Any(any) => any_to_json(&any),
        other => {
            log::debug!("[Canvas] Shared type in element field: {:?}", other);
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::session::RoomKind;
    use crate::model::{Canvas, EditorElement, LinkElement};
    use crate::test_utils::session_context;
    use crate::transport::MemoryHub;
    use serde_json::json;

    fn editor(id: &str, x: f64) -> CanvasElement {
        CanvasElement::Editor(EditorElement {
            id: id.into(),
            x,
            y: 0.0,
            width: 200.0,
            height: 100.0,
            ..Default::default()
        })
    }

    fn canvas_state(id: &str, elements: Vec<CanvasElement>) -> CanvasState {
        CanvasState::new(Canvas {
            id: id.into(),
            elements,
            ..Canvas::new()
        })
    }

    fn session(hub: &MemoryHub, room: &str) -> ReplicatedDocumentSession {
        ReplicatedDocumentSession::create(room, RoomKind::Canvas, false, &session_context(hub)).unwrap()
    }

    /// Apply a change to the shared map as if it came from another peer.
    fn remote<F: FnOnce(&mut TransactionMut, &MapRef)>(session: &ReplicatedDocumentSession, canvas: &str, f: F) {
        let map = session.doc().get_or_insert_map(canvas);
        let mut txn = session.doc().transact_mut_with(Origin::from("peer"));
        f(&mut txn, &map);
    }

    #[test]
    fn test_element_keys() {
        assert_eq!(element_key("E1"), "el:E1");
        assert_eq!(element_id("el:E1"), Some("E1"));
        assert_eq!(element_id("E1"), None);
        assert_eq!(element_id("el:"), None);
    }

    #[test]
    fn test_attach_publishes_and_materializes() {
        let hub = MemoryHub::new();
        let session = session(&hub, "c1");
        remote(&session, "c1", |txn, map| {
            insert_element(txn, map, &editor("remote", 5.0)).unwrap();
        });

        let canvas = canvas_state("c1", vec![editor("local", 1.0)]);
        let replicator = CanvasElementReplicator::attach(&session, &canvas).unwrap();

        assert!(replicator.has_element("local"));
        assert_eq!(canvas.element_ids(), vec!["local", "remote"]);
        assert_eq!(replicator.shared_elements().len(), 2);
    }

    #[test]
    fn test_local_mutations_are_not_echoed() {
        let hub = MemoryHub::new();
        let session = session(&hub, "c1");
        let canvas = canvas_state("c1", vec![]);
        let replicator = CanvasElementReplicator::attach(&session, &canvas).unwrap();

        replicator.add_element(&editor("E1", 0.0)).unwrap();
        assert!(replicator.has_element("E1"));
        // Only the owner appends local elements
        assert!(canvas.elements().is_empty());
    }

    #[test]
    fn test_remote_root_changes() {
        let hub = MemoryHub::new();
        let session = session(&hub, "c1");
        let canvas = canvas_state("c1", vec![]);
        let _replicator = CanvasElementReplicator::attach(&session, &canvas).unwrap();

        remote(&session, "c1", |txn, map| {
            insert_element(txn, map, &editor("A", 1.0)).unwrap();
            insert_element(txn, map, &editor("B", 2.0)).unwrap();
        });
        let mut ids = canvas.element_ids();
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);

        // Bulk replace of one element
        remote(&session, "c1", |txn, map| {
            insert_element(txn, map, &editor("A", 99.0)).unwrap();
        });
        match canvas.element("A").unwrap() {
            CanvasElement::Editor(el) => assert_eq!(el.x, 99.0),
            other => panic!("unexpected {:?}", other),
        }

        remote(&session, "c1", |txn, map| {
            map.remove(txn, &element_key("B"));
        });
        assert_eq!(canvas.element_ids(), vec!["A"]);
    }

    #[test]
    fn test_remote_field_patch_and_delete() {
        let hub = MemoryHub::new();
        let session = session(&hub, "c1");
        let link = CanvasElement::Link(LinkElement {
            id: "L".into(),
            from: "A".into(),
            to: Some("B".into()),
            ..Default::default()
        });
        let canvas = canvas_state("c1", vec![editor("A", 0.0), link]);
        let _replicator = CanvasElementReplicator::attach(&session, &canvas).unwrap();

        remote(&session, "c1", |txn, map| {
            let Some(Out::YMap(nested)) = map.get(txn, &element_key("A")) else {
                panic!("missing element");
            };
            nested.insert(txn, "x", 12.5);
        });
        match canvas.element("A").unwrap() {
            CanvasElement::Editor(el) => assert_eq!(el.x, 12.5),
            other => panic!("unexpected {:?}", other),
        }

        remote(&session, "c1", |txn, map| {
            let Some(Out::YMap(nested)) = map.get(txn, &element_key("L")) else {
                panic!("missing link");
            };
            nested.remove(txn, "to");
        });
        assert_eq!(canvas.element("L").unwrap().as_link().unwrap().to, None);
    }

    #[test]
    fn test_malformed_remote_entries_are_dropped() {
        let hub = MemoryHub::new();
        let session = session(&hub, "c1");
        let canvas = canvas_state("c1", vec![]);
        let _replicator = CanvasElementReplicator::attach(&session, &canvas).unwrap();

        remote(&session, "c1", |txn, map| {
            map.insert(txn, "no-prefix", "x");
            map.insert(txn, element_key("scalar"), 1.0);
            let nested = map.insert(txn, element_key("bad"), MapPrelim::default());
            nested.insert(txn, "type", "hologram");
        });
        assert!(canvas.elements().is_empty());
    }

    #[test]
    fn test_update_element_writes_changed_fields() {
        let hub = MemoryHub::new();
        let session = session(&hub, "c1");
        let canvas = canvas_state("c1", vec![editor("A", 0.0)]);
        let replicator = CanvasElementReplicator::attach(&session, &canvas).unwrap();

        replicator.update_element(&editor("A", 30.0)).unwrap();
        let shared = replicator.shared_elements();
        assert_eq!(shared, vec![editor("A", 30.0)]);

        replicator.remove_many(&["A".to_string()]);
        assert!(!replicator.has_element("A"));
        replicator.add_elements(&[editor("X", 0.0), editor("Y", 0.0)]).unwrap();
        replicator.remove_all();
        assert!(replicator.shared_elements().is_empty());
    }

    #[test]
    fn test_detach_and_stop_silence_observer() {
        let hub = MemoryHub::new();
        let session = session(&hub, "c1");
        let canvas = canvas_state("c1", vec![]);
        let replicator = CanvasElementReplicator::attach(&session, &canvas).unwrap();
        assert!(replicator.is_observing());

        session.start().unwrap();
        session.stop();
        assert!(!replicator.is_observing());
        remote(&session, "c1", |txn, map| {
            insert_element(txn, map, &editor("late", 0.0)).unwrap();
        });
        assert!(canvas.elements().is_empty());

        session.start().unwrap();
        replicator.detach();
        assert!(!replicator.is_observing());
    }

    #[test]
    fn test_json_any_conversion() {
        let value = json!({ "a": [1.5, "x", null, true], "b": { "c": 2.0 } });
        assert_eq!(any_to_json(&json_to_any(value.clone())), value);
    }
}
