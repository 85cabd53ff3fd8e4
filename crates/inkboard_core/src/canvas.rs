//! The active canvas and its element array.
//!
//! [`CanvasState`] owns the materialized element array of one canvas. Both
//! the UI layer and the [`CanvasElementReplicator`](crate::crdt::CanvasElementReplicator)
//! mutate it; the replicator only ever touches single elements, while
//! cascading removal of links is done here.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use indexmap::IndexSet;
use serde_json::Value;

use crate::error::{CollabError, Result};
use crate::model::{Camera, Canvas, CanvasElement, now_millis};

/// Shared handle to the active canvas.
#[derive(Debug, Clone)]
pub struct CanvasState {
    canvas: Arc<RwLock<Canvas>>,
}

impl CanvasState {
    /// Take ownership of `canvas`.
    pub fn new(canvas: Canvas) -> Self {
        Self {
            canvas: Arc::new(RwLock::new(canvas)),
        }
    }

    /// Canvas id.
    pub fn id(&self) -> String {
        self.canvas.read().unwrap().id.clone()
    }

    /// Copy of the canvas record, e.g. for persisting.
    pub fn snapshot(&self) -> Canvas {
        self.canvas.read().unwrap().clone()
    }

    /// Elements in display order.
    pub fn elements(&self) -> Vec<CanvasElement> {
        self.canvas.read().unwrap().elements.clone()
    }

    /// Element ids in display order.
    pub fn element_ids(&self) -> Vec<String> {
        self.canvas
            .read()
            .unwrap()
            .elements
            .iter()
            .map(|el| el.id().to_string())
            .collect()
    }

    /// Look up an element.
    pub fn element(&self, id: &str) -> Option<CanvasElement> {
        self.canvas.read().unwrap().element(id).cloned()
    }

    /// Whether an element exists.
    pub fn contains(&self, id: &str) -> bool {
        self.canvas.read().unwrap().position(id).is_some()
    }

    /// Move the viewport.
    pub fn set_camera(&self, camera: Camera) {
        let mut canvas = self.canvas.write().unwrap();
        canvas.camera = camera;
        canvas.last_modified = now_millis();
    }

    /// Append an element. An element with the same id is replaced in place instead.
    pub fn add_element(&self, element: CanvasElement) {
        let mut canvas = self.canvas.write().unwrap();
        match canvas.position(element.id()) {
            Some(index) => {
                let merged = keep_local_state(&canvas.elements[index], element);
                canvas.elements[index] = merged;
            }
            None => canvas.elements.push(element),
        }
        canvas.last_modified = now_millis();
    }

    /// Replace an element, keeping its local-only state (selection, mounted view).
    pub fn update_element(&self, element: CanvasElement) -> Result<()> {
        let mut canvas = self.canvas.write().unwrap();
        let index = canvas
            .position(element.id())
            .ok_or_else(|| CollabError::NotFound(format!("canvas element {}", element.id())))?;
        let merged = keep_local_state(&canvas.elements[index], element);
        canvas.elements[index] = merged;
        canvas.last_modified = now_millis();
        Ok(())
    }

    /// Set (`Some`) or clear (`None`) one serializable field of an element.
    pub fn patch_element(&self, id: &str, field: &str, value: Option<Value>) -> Result<()> {
        let mut canvas = self.canvas.write().unwrap();
        let index = canvas
            .position(id)
            .ok_or_else(|| CollabError::NotFound(format!("canvas element {}", id)))?;

        let current = &canvas.elements[index];
        let mut fields = current.to_fields()?;
        match value {
            Some(value) => fields.insert(field.to_string(), value),
            None => fields.remove(field),
        };
        let patched = CanvasElement::from_fields(fields)?;
        let merged = keep_local_state(current, patched);
        canvas.elements[index] = merged;
        canvas.last_modified = now_millis();
        Ok(())
    }

    /// Remove one element, without cascading. Returns `true` if it existed.
    pub fn remove_element(&self, id: &str) -> bool {
        let mut canvas = self.canvas.write().unwrap();
        let before = canvas.elements.len();
        canvas.elements.retain(|el| el.id() != id);
        let removed = canvas.elements.len() != before;
        if removed {
            canvas.last_modified = now_millis();
        }
        removed
    }

    /// Remove elements and every link attached to one of them.
    ///
    /// Returns the removed ids: the requested ids that existed first, then
    /// the cascaded links. Ids that are not on the canvas are ignored.
    pub fn remove_elements(&self, ids: &[String]) -> Vec<String> {
        let mut canvas = self.canvas.write().unwrap();
        let targets: IndexSet<String> = {
            let present: HashSet<&str> = canvas.elements.iter().map(|el| el.id()).collect();
            ids.iter()
                .filter(|id| present.contains(id.as_str()))
                .cloned()
                .collect()
        };

        let mut removed = targets.clone();
        canvas.elements.retain(|el| {
            if targets.contains(el.id()) {
                return false;
            }
            if targets.iter().any(|id| el.links_to(id)) {
                removed.insert(el.id().to_string());
                return false;
            }
            true
        });

        if !removed.is_empty() {
            canvas.last_modified = now_millis();
        }
        removed.into_iter().collect()
    }

    /// Links whose target was never set or whose endpoint no longer exists.
    pub fn dead_links(&self) -> Vec<String> {
        let canvas = self.canvas.read().unwrap();
        let ids: HashSet<&str> = canvas.elements.iter().map(|el| el.id()).collect();
        canvas
            .elements
            .iter()
            .filter_map(CanvasElement::as_link)
            .filter(|link| match &link.to {
                None => true,
                Some(to) => !ids.contains(to.as_str()) || !ids.contains(link.from.as_str()),
            })
            .map(|link| link.id.clone())
            .collect()
    }

    /// Remove [dead links](Self::dead_links). Returns the removed ids.
    pub fn remove_dead_links(&self) -> Vec<String> {
        let dead = self.dead_links();
        if !dead.is_empty() {
            let mut canvas = self.canvas.write().unwrap();
            canvas.elements.retain(|el| !dead.iter().any(|id| id == el.id()));
            canvas.last_modified = now_millis();
            log::info!("[Canvas] Removed {} dead links", dead.len());
        }
        dead
    }

    /// Remove every element. Returns the removed ids.
    pub fn clear(&self) -> Vec<String> {
        let mut canvas = self.canvas.write().unwrap();
        let ids = canvas
            .elements
            .drain(..)
            .map(|el| el.id().to_string())
            .collect();
        canvas.last_modified = now_millis();
        ids
    }
}

/// Carry the local-only fields of `old` over to `new`.
fn keep_local_state(old: &CanvasElement, mut new: CanvasElement) -> CanvasElement {
    match (old, &mut new) {
        (CanvasElement::Editor(old), CanvasElement::Editor(new))
        | (CanvasElement::Code(old), CanvasElement::Code(new)) => {
            new.selected = old.selected;
            new.active = old.active;
            new.view = old.view;
        }
        (CanvasElement::Image(old), CanvasElement::Image(new))
        | (CanvasElement::Video(old), CanvasElement::Video(new)) => {
            new.selected = old.selected;
        }
        (CanvasElement::Link(old), CanvasElement::Link(new)) => {
            new.selected = old.selected;
            new.drawing = old.drawing;
        }
        _ => {}
    }
    new
}
