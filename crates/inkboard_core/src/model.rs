//! Persisted entities: files, canvases, canvas elements and versions.
//!
//! These types cross the boundary to the UI layer and to the persistence
//! collaborator, so they serialize in camelCase and export TypeScript
//! bindings.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Serde adapter storing binary blobs as base64 strings in JSON.
pub(crate) mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A saved point-in-time state of a file's replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct Version {
    /// Unix timestamp (milliseconds) when the version was captured
    pub date: i64,
    /// Encoded causal snapshot (v1 encoding)
    #[serde(with = "base64_bytes")]
    #[ts(type = "string")]
    pub snapshot: Vec<u8>,
    /// Replica that captured the version
    pub replica: String,
    /// Replica client id that stored the version entry
    #[serde(default)]
    #[ts(type = "number")]
    pub client_id: u64,
}

/// A text document: rich text, markdown or code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Stable document id; doubles as the collaboration room id
    pub id: String,
    /// Serialized replica state (full v1 update)
    #[serde(default, with = "base64_bytes")]
    #[ts(type = "string")]
    pub ydoc: Vec<u8>,
    /// Parent file or canvas in the sidebar tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Preceding sibling in the sidebar tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_id: Option<String>,
    /// Unix timestamp (milliseconds) of the last local change
    #[serde(default)]
    pub last_modified: i64,
    /// Backing file on disk, if the document mirrors one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Document is markdown source rather than rich text
    #[serde(default)]
    pub markdown: bool,
    /// Document is a code file bound to the shared code text
    #[serde(default)]
    pub code: bool,
    /// Language of a code file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_lang: Option<String>,
    /// Append-only, time-ordered version list
    #[serde(default)]
    pub versions: Vec<Version>,
}

impl File {
    /// Create an empty file with a fresh id.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            last_modified: now_millis(),
            ..Default::default()
        }
    }
}

/// Viewport of a canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Camera {
    /// Top-left point of the viewport in canvas coordinates
    pub point: [f64; 2],
    /// Zoom factor
    pub zoom: f64,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            point: [0.0, 0.0],
            zoom: 1.0,
        }
    }
}

/// A free-form board of elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    /// Stable canvas id; doubles as the collaboration room id
    pub id: String,
    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Current viewport
    #[serde(default)]
    pub camera: Camera,
    /// Materialized element array, in local display order
    #[serde(default)]
    pub elements: Vec<CanvasElement>,
    /// Parent file or canvas in the sidebar tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Preceding sibling in the sidebar tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_id: Option<String>,
    /// Unix timestamp (milliseconds) of the last local change
    #[serde(default)]
    pub last_modified: i64,
    /// Snap element positions to the grid
    #[serde(default)]
    pub snap_to_grid: bool,
}

impl Canvas {
    /// Create an empty canvas with a fresh id.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            last_modified: now_millis(),
            ..Default::default()
        }
    }

    /// Look up an element by id.
    pub fn element(&self, id: &str) -> Option<&CanvasElement> {
        self.elements.iter().find(|el| el.id() == id)
    }

    /// Position of an element in the materialized array.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.elements.iter().position(|el| el.id() == id)
    }
}

/// Side of a box element a link attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    /// Top edge
    Top,
    /// Right edge
    Right,
    /// Bottom edge
    Bottom,
    /// Left edge
    Left,
}

/// Opaque handle to a live editing view mounted for an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewHandle(pub u64);

/// Box element showing a file's editor (rich text or code).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct EditorElement {
    /// Element id; for editors this is the id of the shown file
    pub id: String,
    /// Left position
    pub x: f64,
    /// Top position
    pub y: f64,
    /// Box width
    pub width: f64,
    /// Box height
    pub height: f64,
    /// Locally selected (not replicated)
    #[serde(skip)]
    #[ts(skip)]
    pub selected: bool,
    /// Locally focused for editing (not replicated)
    #[serde(skip)]
    #[ts(skip)]
    pub active: bool,
    /// Mounted editing view (not replicated)
    #[serde(skip)]
    #[ts(skip)]
    pub view: Option<ViewHandle>,
}

/// Box element showing an image or a video.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct MediaElement {
    /// Element id
    pub id: String,
    /// Source URL or path
    pub src: String,
    /// Left position
    pub x: f64,
    /// Top position
    pub y: f64,
    /// Box width
    pub width: f64,
    /// Box height
    pub height: f64,
    /// MIME type, for videos
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Locally selected (not replicated)
    #[serde(skip)]
    #[ts(skip)]
    pub selected: bool,
}

/// Arrow between two box elements, or dangling from one while being drawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "camelCase")]
pub struct LinkElement {
    /// Element id
    pub id: String,
    /// Source element id
    pub from: String,
    /// Edge of the source element
    pub from_edge: Option<EdgeType>,
    /// Target element id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Edge of the target element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_edge: Option<EdgeType>,
    /// Free end point while the link has no target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_x: Option<f64>,
    /// Free end point while the link has no target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_y: Option<f64>,
    /// Locally being drawn (not replicated)
    #[serde(skip)]
    #[ts(skip)]
    pub drawing: bool,
    /// Locally selected (not replicated)
    #[serde(skip)]
    #[ts(skip)]
    pub selected: bool,
}

/// An element on a canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CanvasElement {
    /// Rich-text editor box
    Editor(EditorElement),
    /// Code editor box
    Code(EditorElement),
    /// Link between elements
    Link(LinkElement),
    /// Image box
    Image(MediaElement),
    /// Video box
    Video(MediaElement),
}

impl CanvasElement {
    /// Element id.
    pub fn id(&self) -> &str {
        match self {
            CanvasElement::Editor(el) | CanvasElement::Code(el) => &el.id,
            CanvasElement::Link(el) => &el.id,
            CanvasElement::Image(el) | CanvasElement::Video(el) => &el.id,
        }
    }

    /// Returns the link payload for link elements.
    pub fn as_link(&self) -> Option<&LinkElement> {
        match self {
            CanvasElement::Link(link) => Some(link),
            _ => None,
        }
    }

    /// True when this is a link with `id` as either endpoint.
    pub fn links_to(&self, id: &str) -> bool {
        self.as_link()
            .is_some_and(|link| link.from == id || link.to.as_deref() == Some(id))
    }

    /// Serializable fields of this element as a JSON object, including `type`.
    ///
    /// Local-only state (selection, mounted views) is not part of the result.
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "element serialized to non-object: {}",
                other
            ))),
        }
    }

    /// Rebuild an element from its serializable fields.
    pub fn from_fields(fields: serde_json::Map<String, serde_json::Value>) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::Value::Object(fields))
    }
}
