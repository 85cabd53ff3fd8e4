#![doc = include_str!("README.md")]

mod canvas_replicator;
pub mod content;
mod editor_binding;
mod memory_storage;
mod observers;
mod session;
mod storage;
pub(crate) mod sync;
mod types;
mod versioning;

pub use canvas_replicator::{CanvasElementReplicator, ELEMENT_KEY_PREFIX, element_id, element_key};
pub use content::DocNode;
pub use editor_binding::{
    BindingMode, CURSOR_FIELD, ChangeSource, EditorBinding, EditorView, Selection, SharedContent,
    TransactionMeta, ViewDocument, ViewTransaction,
};
pub use memory_storage::MemoryStorage;
pub use observers::{ArmFn, ObserverId, ObserverRegistry};
pub use session::{
    CONFIG_MAP, ReplicatedDocumentSession, RoomIndicator, RoomKind, SessionContext, SessionSlot,
    SessionStatus, SharedRoomIndicator, room_path,
};
pub use storage::{Storage, StorageResult, StoredUpdate};
pub use sync::{Message, SyncMessage, SyncOutcome, SyncProtocol};
pub use types::{LOAD_ORIGIN, OriginClassifier, REMOTE_ORIGIN, ReplicaId, UpdateOrigin};
pub use versioning::{SnapshotVersioning, VERSIONS_ARRAY};
