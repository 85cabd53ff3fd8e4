//! Structured document content and its mapping onto shared types.
//!
//! A rich-text document is a [`DocNode`] tree in the JSON shape editing views
//! exchange (`{type, attrs, content, text}`). In the replica it lives in an
//! XML fragment: element nodes become XML elements (attributes hold
//! JSON-encoded values) and text nodes become XML text.
//!
//! Writes are minimal diffs so unchanged content keeps its CRDT identity and
//! concurrent edits merge instead of clobbering each other.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::types::xml::{XmlElementPrelim, XmlElementRef, XmlFragment, XmlOut, XmlTextPrelim, XmlTextRef};
use yrs::{GetString, Out, ReadTxn, Text, TextRef, TransactionMut, Xml, XmlFragmentRef};

use crate::error::{CollabError, Result};

/// Node type of text leaves.
pub const TEXT_NODE: &str = "text";

/// Node type of the document root.
pub const DOC_NODE: &str = "doc";

/// A node of a structured document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocNode {
    /// Node type, e.g. "doc", "paragraph", "heading", "text"
    #[serde(rename = "type")]
    pub kind: String,
    /// Node attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
    /// Child nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<DocNode>,
    /// Text of a text leaf
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl DocNode {
    /// A document root with `content`.
    pub fn doc(content: Vec<DocNode>) -> Self {
        Self::element(DOC_NODE, content)
    }

    /// An element node.
    pub fn element(kind: &str, content: Vec<DocNode>) -> Self {
        Self {
            kind: kind.to_string(),
            attrs: BTreeMap::new(),
            content,
            text: None,
        }
    }

    /// A text leaf.
    pub fn text(text: &str) -> Self {
        Self {
            kind: TEXT_NODE.to_string(),
            attrs: BTreeMap::new(),
            content: Vec::new(),
            text: Some(text.to_string()),
        }
    }

    /// A paragraph holding `text` (empty paragraphs have no children).
    pub fn paragraph(text: &str) -> Self {
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![Self::text(text)]
        };
        Self::element("paragraph", content)
    }

    /// Builder: set an attribute.
    pub fn with_attr(mut self, key: &str, value: Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    /// Whether this is a text leaf.
    pub fn is_text(&self) -> bool {
        self.kind == TEXT_NODE
    }

    /// Parse a document from its JSON representation.
    pub fn from_json(json: &Value) -> Result<Self> {
        Ok(serde_json::from_value(json.clone())?)
    }

    /// Plain text of the subtree, blocks separated by newlines.
    pub fn text_content(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        let inline = self.content.iter().all(DocNode::is_text);
        let parts: Vec<String> = self.content.iter().map(DocNode::text_content).collect();
        parts.join(if inline { "" } else { "\n" })
    }

    /// Copy without empty text leaves, the shape views expect.
    pub fn normalized(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            attrs: self.attrs.clone(),
            content: self
                .content
                .iter()
                .filter(|child| !(child.is_text() && child.text.as_deref().unwrap_or("").is_empty()))
                .map(DocNode::normalized)
                .collect(),
            text: self.text.clone(),
        }
    }
}

// ===========================================================================
// Reading
// ===========================================================================

/// Attribute values arrive either as plain strings or as shared values,
/// depending on the writer.
trait AttrText {
    fn into_attr_text<T: ReadTxn>(self, txn: &T) -> String;
}

impl AttrText for String {
    fn into_attr_text<T: ReadTxn>(self, _txn: &T) -> String {
        self
    }
}

impl AttrText for Out {
    fn into_attr_text<T: ReadTxn>(self, txn: &T) -> String {
        self.to_string(txn)
    }
}

fn decode_attr(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn encode_attr(value: &Value) -> String {
    match value {
        // Plain strings stay readable for other clients
        Value::String(s) if serde_json::from_str::<Value>(s).is_err() => s.clone(),
        other => other.to_string(),
    }
}

/// Materialize a fragment as a document root.
///
/// The result maps 1:1 onto the fragment's children (empty text leaves
/// included); use [`DocNode::normalized`] before handing it to a view.
pub fn read_fragment<T: ReadTxn>(txn: &T, fragment: &XmlFragmentRef) -> Result<DocNode> {
    Ok(DocNode::doc(read_children(txn, fragment)?))
}

fn read_children<T: ReadTxn, F: XmlFragment>(txn: &T, parent: &F) -> Result<Vec<DocNode>> {
    let len = parent.len(txn);
    let mut nodes = Vec::with_capacity(len as usize);
    for index in 0..len {
        match parent.get(txn, index) {
            Some(XmlOut::Element(element)) => nodes.push(read_element(txn, &element)?),
            Some(XmlOut::Text(text)) => nodes.push(DocNode::text(&text.get_string(txn))),
            Some(XmlOut::Fragment(_)) => {
                return Err(CollabError::MalformedRemoteUpdate(
                    "nested fragment inside document content".into(),
                ));
            }
            None => {
                return Err(CollabError::MalformedRemoteUpdate(format!(
                    "missing child {} of {}",
                    index, len
                )));
            }
        }
    }
    Ok(nodes)
}

fn read_element<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Result<DocNode> {
    let mut node = DocNode::element(element.tag(), read_children(txn, element)?);
    for (name, value) in element.attributes(txn) {
        node.attrs
            .insert(name.to_string(), decode_attr(value.into_attr_text(txn)));
    }
    Ok(node)
}

// ===========================================================================
// Writing
// ===========================================================================

/// A minimal single-splice edit turning one string into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSplice {
    /// Byte offset of the splice
    pub index: u32,
    /// Bytes to remove at `index`
    pub remove: u32,
    /// Text to insert at `index`
    pub insert: String,
}

/// Compute the common-prefix/common-suffix splice between `current` and `new`.
///
/// Returns `None` when the strings are equal. Offsets are byte offsets on
/// character boundaries.
pub fn text_splice(current: &str, new: &str) -> Option<TextSplice> {
    if current == new {
        return None;
    }

    let current_chars: Vec<char> = current.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let common_prefix = current_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    // Don't let the suffix overlap the prefix
    let remaining_current = current_chars.len() - common_prefix;
    let remaining_new = new_chars.len() - common_prefix;
    let common_suffix = current_chars[common_prefix..]
        .iter()
        .rev()
        .zip(new_chars[common_prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .take(remaining_current.min(remaining_new))
        .count();

    let byte_len = |chars: &[char]| chars.iter().map(|c| c.len_utf8()).sum::<usize>() as u32;

    Some(TextSplice {
        index: byte_len(&current_chars[..common_prefix]),
        remove: byte_len(&current_chars[common_prefix..current_chars.len() - common_suffix]),
        insert: new_chars[common_prefix..new_chars.len() - common_suffix]
            .iter()
            .collect(),
    })
}

fn apply_splice<X: Text>(txn: &mut TransactionMut, text: &X, splice: &TextSplice) {
    if splice.remove > 0 {
        text.remove_range(txn, splice.index, splice.remove);
    }
    if !splice.insert.is_empty() {
        text.insert(txn, splice.index, &splice.insert);
    }
}

/// Set a shared text to `content` with a minimal splice.
///
/// Returns `true` if the text changed.
pub fn write_text(txn: &mut TransactionMut, text: &TextRef, content: &str) -> bool {
    let current = text.get_string(txn);
    match text_splice(&current, content) {
        Some(splice) => {
            apply_splice(txn, text, &splice);
            true
        }
        None => false,
    }
}

/// Bring the fragment's content in line with `doc`, touching only what differs.
///
/// Returns `true` if anything changed.
pub fn write_fragment(txn: &mut TransactionMut, fragment: &XmlFragmentRef, doc: &DocNode) -> bool {
    let target = doc.normalized();
    match read_fragment(txn, fragment) {
        Ok(current) if current == target => false,
        Ok(current) => {
            sync_children(txn, fragment, &current.content, &target.content);
            true
        }
        Err(e) => {
            log::warn!("[Binding] Replacing unreadable fragment content: {}", e);
            replace_fragment(txn, fragment, &target);
            true
        }
    }
}

/// Replace the fragment's entire content with `doc` (no diffing).
pub fn replace_fragment(txn: &mut TransactionMut, fragment: &XmlFragmentRef, doc: &DocNode) {
    let len = fragment.len(txn);
    if len > 0 {
        fragment.remove_range(txn, 0, len);
    }
    for (index, child) in doc.normalized().content.iter().enumerate() {
        insert_node(txn, fragment, index as u32, child);
    }
}

fn insert_node<F: XmlFragment>(txn: &mut TransactionMut, parent: &F, index: u32, node: &DocNode) {
    if node.is_text() {
        let text = node.text.as_deref().unwrap_or("");
        parent.insert(txn, index, XmlTextPrelim::new(text));
        return;
    }
    let element = parent.insert(txn, index, XmlElementPrelim::empty(node.kind.as_str()));
    for (name, value) in &node.attrs {
        element.insert_attribute(txn, name.as_str(), encode_attr(value));
    }
    for (child_index, child) in node.content.iter().enumerate() {
        insert_node(txn, &element, child_index as u32, child);
    }
}

/// Same shape: can be patched in place instead of replaced.
fn patchable(old: &DocNode, new: &DocNode) -> bool {
    old.kind == new.kind && old.is_text() == new.is_text()
}

fn sync_children<F: XmlFragment>(
    txn: &mut TransactionMut,
    parent: &F,
    old: &[DocNode],
    new: &[DocNode],
) {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    let paired = old_mid.len().min(new_mid.len());

    for offset in 0..paired {
        let index = (prefix + offset) as u32;
        let (old_node, new_node) = (&old_mid[offset], &new_mid[offset]);
        if patchable(old_node, new_node) {
            patch_node(txn, parent, index, old_node, new_node);
        } else {
            parent.remove_range(txn, index, 1);
            insert_node(txn, parent, index, new_node);
        }
    }

    let tail = (prefix + paired) as u32;
    if old_mid.len() > paired {
        parent.remove_range(txn, tail, (old_mid.len() - paired) as u32);
    }
    for (offset, node) in new_mid[paired..].iter().enumerate() {
        insert_node(txn, parent, tail + offset as u32, node);
    }
}

fn patch_node<F: XmlFragment>(
    txn: &mut TransactionMut,
    parent: &F,
    index: u32,
    old: &DocNode,
    new: &DocNode,
) {
    match parent.get(txn, index) {
        Some(XmlOut::Text(text)) => patch_text(txn, &text, new),
        Some(XmlOut::Element(element)) => {
            for name in old.attrs.keys().filter(|k| !new.attrs.contains_key(*k)) {
                element.remove_attribute(txn, &name.as_str());
            }
            for (name, value) in &new.attrs {
                if old.attrs.get(name) != Some(value) {
                    element.insert_attribute(txn, name.as_str(), encode_attr(value));
                }
            }
            sync_children(txn, &element, &old.content, &new.content);
        }
        _ => {
            parent.remove_range(txn, index, 1);
            insert_node(txn, parent, index, new);
        }
    }
}

fn patch_text(txn: &mut TransactionMut, text: &XmlTextRef, new: &DocNode) {
    let current = text.get_string(txn);
    if let Some(splice) = text_splice(&current, new.text.as_deref().unwrap_or("")) {
        apply_splice(txn, text, &splice);
    }
}
