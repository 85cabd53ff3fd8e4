//! Sidebar hierarchy of files and canvases.
//!
//! Entities do not store their children. Each one carries an optional
//! `parent_id` (its group) and an optional `left_id` (its predecessor in that
//! group), so every sibling group is a singly linked list. [`SiblingOrderTree`]
//! keeps the flat entities and rebuilds the ordered [`TreeNode`] forest after
//! every structural change.
//!
//! Broken chains never fail a rebuild: nodes that cannot be placed by
//! following predecessors (duplicate predecessors, cycles) are appended after
//! the properly chained ones, in encounter order. Nodes whose parent chain
//! never reaches a root are appended at the root level the same way.

use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CollabError, Result};
use crate::model::{Canvas, File, now_millis};

/// An entity placed in the sidebar tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "kind", content = "item", rename_all = "lowercase")]
pub enum TreeEntity {
    /// A text document
    File(File),
    /// A canvas
    Canvas(Canvas),
}

impl TreeEntity {
    /// Entity id.
    pub fn id(&self) -> &str {
        match self {
            TreeEntity::File(file) => &file.id,
            TreeEntity::Canvas(canvas) => &canvas.id,
        }
    }

    /// Parent (group) pointer.
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            TreeEntity::File(file) => file.parent_id.as_deref(),
            TreeEntity::Canvas(canvas) => canvas.parent_id.as_deref(),
        }
    }

    /// Predecessor pointer.
    pub fn left_id(&self) -> Option<&str> {
        match self {
            TreeEntity::File(file) => file.left_id.as_deref(),
            TreeEntity::Canvas(canvas) => canvas.left_id.as_deref(),
        }
    }

    /// Display name: the canvas title or the file path, falling back to the id.
    pub fn name(&self) -> &str {
        match self {
            TreeEntity::File(file) => file.path.as_deref().unwrap_or(&file.id),
            TreeEntity::Canvas(canvas) => canvas.title.as_deref().unwrap_or(&canvas.id),
        }
    }

    fn set_parent(&mut self, parent_id: Option<String>) {
        match self {
            TreeEntity::File(file) => file.parent_id = parent_id,
            TreeEntity::Canvas(canvas) => canvas.parent_id = parent_id,
        }
    }

    fn set_left(&mut self, left_id: Option<String>) {
        match self {
            TreeEntity::File(file) => file.left_id = left_id,
            TreeEntity::Canvas(canvas) => canvas.left_id = left_id,
        }
    }

    fn touch(&mut self) {
        match self {
            TreeEntity::File(file) => file.last_modified = now_millis(),
            TreeEntity::Canvas(canvas) => canvas.last_modified = now_millis(),
        }
    }
}

impl From<File> for TreeEntity {
    fn from(file: File) -> Self {
        TreeEntity::File(file)
    }
}

impl From<Canvas> for TreeEntity {
    fn from(canvas: Canvas) -> Self {
        TreeEntity::Canvas(canvas)
    }
}

/// Node in the sidebar tree (for display purposes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TreeNode {
    /// The placed entity
    pub item: TreeEntity,
    /// Ordered children
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Entity id.
    pub fn id(&self) -> &str {
        self.item.id()
    }
}

/// Helper function to format a tree node for display
pub fn format_tree_node(node: &TreeNode, prefix: &str) -> String {
    let mut result = String::new();
    result.push_str(node.item.name());
    result.push('\n');

    let child_count = node.children.len();
    for (i, child) in node.children.iter().enumerate() {
        let is_last_child = i == child_count - 1;
        let connector = if is_last_child { "└── " } else { "├── " };
        let child_prefix = if is_last_child { "    " } else { "│   " };

        result.push_str(prefix);
        result.push_str(connector);
        result.push_str(&format_tree_node(child, &format!("{}{}", prefix, child_prefix)));
    }

    result
}

/// Order one sibling group by following predecessor pointers.
///
/// Returns the chained ids followed by the indeterminate bucket.
fn sort_group<'a>(ids: &[&'a str], entities: &'a IndexMap<String, TreeEntity>) -> Vec<&'a str> {
    let mut remaining: Vec<&str> = ids.to_vec();
    let mut sorted = Vec::with_capacity(ids.len());
    let mut last: Option<&str> = None;

    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .position(|id| entities.get(*id).and_then(TreeEntity::left_id) == last);
        match next {
            Some(index) => {
                let id = remaining.remove(index);
                sorted.push(id);
                last = Some(id);
            }
            None => {
                log::debug!(
                    "[Tree] {} sibling(s) after {:?} have no chained predecessor",
                    remaining.len(),
                    last
                );
                sorted.append(&mut remaining);
            }
        }
    }

    sorted
}

/// Files and canvases ordered into a forest by their parent/predecessor pointers.
#[derive(Debug, Clone, Default)]
pub struct SiblingOrderTree {
    entities: IndexMap<String, TreeEntity>,
    roots: Vec<TreeNode>,
}

impl SiblingOrderTree {
    /// Build a tree from entities in encounter order.
    pub fn new(entities: impl IntoIterator<Item = TreeEntity>) -> Self {
        let mut tree = Self {
            entities: entities
                .into_iter()
                .map(|entity| (entity.id().to_string(), entity))
                .collect(),
            roots: Vec::new(),
        };
        tree.rebuild();
        tree
    }

    /// Ordered top-level nodes.
    pub fn roots(&self) -> &[TreeNode] {
        &self.roots
    }

    /// Look up an entity.
    pub fn get(&self, id: &str) -> Option<&TreeEntity> {
        self.entities.get(id)
    }

    /// All entities in encounter order.
    pub fn entities(&self) -> impl Iterator<Item = &TreeEntity> {
        self.entities.values()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Look up a placed node.
    pub fn node(&self, id: &str) -> Option<&TreeNode> {
        fn find<'a>(nodes: &'a [TreeNode], id: &str) -> Option<&'a TreeNode> {
            nodes
                .iter()
                .find_map(|node| if node.id() == id { Some(node) } else { find(&node.children, id) })
        }
        find(&self.roots, id)
    }

    /// Ordered child ids of `parent` (`None` for the root level).
    pub fn child_ids(&self, parent: Option<&str>) -> Vec<String> {
        let nodes = match parent {
            None => &self.roots[..],
            Some(parent) => match self.node(parent) {
                Some(node) => &node.children[..],
                None => return Vec::new(),
            },
        };
        nodes.iter().map(|node| node.id().to_string()).collect()
    }

    /// Every id below `id`, depth first.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        fn collect(node: &TreeNode, out: &mut Vec<String>) {
            for child in &node.children {
                out.push(child.id().to_string());
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        if let Some(node) = self.node(id) {
            collect(node, &mut out);
        }
        out
    }

    /// Whether `ancestor` is on the parent chain of `id`.
    pub fn is_descendant(&self, id: &str, ancestor: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = self.get(id).and_then(TreeEntity::parent_id);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            if !seen.insert(parent) {
                return false;
            }
            current = self.get(parent).and_then(TreeEntity::parent_id);
        }
        false
    }

    /// Recompute the ordered forest from the flat pointers.
    pub fn rebuild(&mut self) {
        let mut groups: HashMap<Option<&str>, Vec<&str>> = HashMap::new();
        for entity in self.entities.values() {
            let parent = entity
                .parent_id()
                .filter(|parent| self.entities.contains_key(*parent) && *parent != entity.id());
            groups.entry(parent).or_default().push(entity.id());
        }

        let mut placed = HashSet::new();
        let root_ids = groups.get(&None).cloned().unwrap_or_default();
        let mut roots = self.build_group(&root_ids, &groups, &mut placed);

        // Parent cycles never reach a root
        let unreachable: Vec<&str> = self
            .entities
            .keys()
            .map(String::as_str)
            .filter(|id| !placed.contains(id))
            .collect();
        if !unreachable.is_empty() {
            log::warn!(
                "[Tree] {} node(s) unreachable from the root, appending them at the top level",
                unreachable.len()
            );
            for id in unreachable {
                if placed.contains(id) {
                    continue;
                }
                if let Some(node) = self.build_node(id, &groups, &mut placed) {
                    roots.push(node);
                }
            }
        }

        self.roots = roots;
    }

    fn build_group<'a>(
        &'a self,
        ids: &[&'a str],
        groups: &HashMap<Option<&'a str>, Vec<&'a str>>,
        placed: &mut HashSet<&'a str>,
    ) -> Vec<TreeNode> {
        sort_group(ids, &self.entities)
            .into_iter()
            .filter_map(|id| self.build_node(id, groups, placed))
            .collect()
    }

    fn build_node<'a>(
        &'a self,
        id: &'a str,
        groups: &HashMap<Option<&'a str>, Vec<&'a str>>,
        placed: &mut HashSet<&'a str>,
    ) -> Option<TreeNode> {
        if !placed.insert(id) {
            return None;
        }
        let item = self.entities.get(id)?.clone();
        let children = match groups.get(&Some(id)) {
            Some(ids) => self.build_group(ids, groups, placed),
            None => Vec::new(),
        };
        Some(TreeNode { item, children })
    }

    // ==================== Mutations ====================
    //
    // Every mutation returns the ids whose pointers changed, for the caller
    // to persist.

    /// Add an entity as the last child of its `parent_id`.
    pub fn add(&mut self, entity: impl Into<TreeEntity>) -> Result<Vec<String>> {
        let mut entity = entity.into();
        let id = entity.id().to_string();
        if self.entities.contains_key(&id) {
            return Err(CollabError::StructuralConflict(format!("{} is already in the tree", id)));
        }
        let parent = entity.parent_id().map(str::to_string);
        if let Some(parent) = &parent
            && !self.entities.contains_key(parent)
        {
            return Err(CollabError::NotFound(parent.clone()));
        }

        let left = self.child_ids(parent.as_deref()).pop();
        entity.set_left(left);
        entity.touch();
        self.entities.insert(id.clone(), entity);
        self.rebuild();
        Ok(vec![id])
    }

    /// Remove an entity. Its successor takes over its predecessor.
    ///
    /// Only the entity itself is removed: its children move up into its
    /// place, in order, under its parent. To drop a whole subtree, remove
    /// [`descendants`](Self::descendants) in reverse order first.
    pub fn remove(&mut self, id: &str) -> Result<Vec<String>> {
        let removed = self
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| CollabError::NotFound(id.to_string()))?;
        let parent = removed.parent_id().map(str::to_string);
        let left = removed.left_id().map(str::to_string);
        let children = self.child_ids(Some(id));

        let mut changed = IndexSet::new();
        let successor_left = children.last().cloned().or_else(|| left.clone());
        for successor in self.pointing_at(parent.as_deref(), Some(id)) {
            self.set_pointers(&successor, parent.clone(), successor_left.clone(), &mut changed);
        }
        for (index, child) in children.iter().enumerate() {
            let child_left = match index {
                0 => left.clone(),
                _ => Some(children[index - 1].clone()),
            };
            self.set_pointers(child, parent.clone(), child_left, &mut changed);
        }

        self.entities.shift_remove(id);
        changed.shift_remove(id);
        changed.insert(id.to_string());
        self.rebuild();
        Ok(changed.into_iter().collect())
    }

    /// Place `id` under `parent` right after `left` (`None`: first child).
    ///
    /// The node's former successor is re-pointed at the node's former
    /// predecessor, and whichever node followed `left` now follows `id`.
    pub fn move_to(&mut self, id: &str, parent: Option<&str>, left: Option<&str>) -> Result<Vec<String>> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| CollabError::NotFound(id.to_string()))?;
        if let Some(parent) = parent {
            if !self.entities.contains_key(parent) {
                return Err(CollabError::NotFound(parent.to_string()));
            }
            if parent == id || self.is_descendant(parent, id) {
                return Err(CollabError::StructuralConflict(format!(
                    "cannot move {} into itself or its descendant {}",
                    id, parent
                )));
            }
        }
        if let Some(left) = left {
            if left == id {
                return Err(CollabError::StructuralConflict(format!("{} cannot follow itself", id)));
            }
            let anchor = self
                .entities
                .get(left)
                .ok_or_else(|| CollabError::NotFound(left.to_string()))?;
            if anchor.parent_id() != parent {
                return Err(CollabError::StructuralConflict(format!(
                    "{} is not a child of {:?}",
                    left, parent
                )));
            }
        }

        let old_parent = entity.parent_id().map(str::to_string);
        let old_left = entity.left_id().map(str::to_string);
        let mut changed = IndexSet::new();

        for successor in self.pointing_at(old_parent.as_deref(), Some(id)) {
            self.set_pointers(&successor, old_parent.clone(), old_left.clone(), &mut changed);
        }
        for follower in self.pointing_at(parent, left) {
            if follower != id {
                self.set_pointers(
                    &follower,
                    parent.map(str::to_string),
                    Some(id.to_string()),
                    &mut changed,
                );
            }
        }
        self.set_pointers(id, parent.map(str::to_string), left.map(str::to_string), &mut changed);
        // A moved node is always reported
        changed.insert(id.to_string());

        self.rebuild();
        Ok(changed.into_iter().collect())
    }

    /// Move `id` right after `target`, into `target`'s group.
    pub fn insert_after(&mut self, id: &str, target: &str) -> Result<Vec<String>> {
        let parent = self.parent_of(target)?;
        self.move_to(id, parent.as_deref(), Some(target))
    }

    /// Move `id` right before `target`, into `target`'s group.
    pub fn insert_before(&mut self, id: &str, target: &str) -> Result<Vec<String>> {
        let parent = self.parent_of(target)?;
        if id == target {
            return Err(CollabError::StructuralConflict(format!("{} cannot precede itself", id)));
        }
        let siblings = self.child_ids(parent.as_deref());
        let left = siblings
            .iter()
            .take_while(|sibling| sibling.as_str() != target)
            .filter(|sibling| sibling.as_str() != id)
            .last()
            .cloned();
        self.move_to(id, parent.as_deref(), left.as_deref())
    }

    /// Move `id` to the end of `parent`'s children (`None`: the root level).
    pub fn move_into(&mut self, id: &str, parent: Option<&str>) -> Result<Vec<String>> {
        let left = self
            .child_ids(parent)
            .into_iter()
            .rfind(|sibling| sibling != id);
        self.move_to(id, parent, left.as_deref())
    }

    fn parent_of(&self, id: &str) -> Result<Option<String>> {
        self.entities
            .get(id)
            .map(|entity| entity.parent_id().map(str::to_string))
            .ok_or_else(|| CollabError::NotFound(id.to_string()))
    }

    /// Ids in group `parent` whose predecessor is `left`.
    fn pointing_at(&self, parent: Option<&str>, left: Option<&str>) -> Vec<String> {
        self.entities
            .values()
            .filter(|entity| entity.parent_id() == parent && entity.left_id() == left)
            .map(|entity| entity.id().to_string())
            .collect()
    }

    fn set_pointers(
        &mut self,
        id: &str,
        parent: Option<String>,
        left: Option<String>,
        changed: &mut IndexSet<String>,
    ) {
        if let Some(entity) = self.entities.get_mut(id)
            && (entity.parent_id() != parent.as_deref() || entity.left_id() != left.as_deref())
        {
            entity.set_parent(parent);
            entity.set_left(left);
            entity.touch();
            changed.insert(id.to_string());
        }
    }
}
