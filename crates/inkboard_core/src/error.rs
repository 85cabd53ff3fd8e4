use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Unified error type for inkboard operations
#[derive(Debug, Error)]
pub enum CollabError {
    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session for room '{0}' is not connected")]
    NotConnected(String),

    #[error("A live session for room '{0}' already exists")]
    SessionAlreadyLive(String),

    // Replica errors
    #[error("Malformed remote update: {0}")]
    MalformedRemoteUpdate(String),

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Failed to decode snapshot of version {index}: {reason}")]
    SnapshotDecode { index: usize, reason: String },

    // Tree errors
    #[error("Structural conflict: {0}")]
    StructuralConflict(String),

    #[error("Item '{0}' not found")]
    NotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type alias for inkboard operations
pub type Result<T> = std::result::Result<T, CollabError>;

/// The four failure classes surfaced to the UI layer.
///
/// Every error produced by an externally triggered operation maps onto one
/// of these via [`CollabError::class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorClass {
    /// Connection failure. The session is stopped and marked errored.
    Transport,
    /// A remote (or stored) operation could not be translated. Dropped.
    MalformedRemoteUpdate,
    /// A sibling-chain or parent-chain conflict.
    StructuralConflict,
    /// A stored snapshot could not be decoded. Only that version is skipped.
    SnapshotDecode,
}

impl CollabError {
    /// Classify this error for the UI layer.
    pub fn class(&self) -> ErrorClass {
        match self {
            CollabError::Transport(_)
            | CollabError::NotConnected(_)
            | CollabError::SessionAlreadyLive(_)
            | CollabError::Io(_)
            | CollabError::FileRead { .. }
            | CollabError::FileWrite { .. }
            | CollabError::Storage(_)
            | CollabError::NoConfigDir
            | CollabError::ConfigParse(_)
            | CollabError::ConfigSerialize(_) => ErrorClass::Transport,
            CollabError::MalformedRemoteUpdate(_) | CollabError::Crdt(_) | CollabError::Json(_) => {
                ErrorClass::MalformedRemoteUpdate
            }
            CollabError::StructuralConflict(_) | CollabError::NotFound(_) => {
                ErrorClass::StructuralConflict
            }
            CollabError::SnapshotDecode { .. } => ErrorClass::SnapshotDecode,
        }
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of CollabError for IPC with the UI layer
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Failure class
    pub class: ErrorClass,
    /// Human-readable error message
    pub message: String,
    /// Associated path (if applicable)
    pub path: Option<PathBuf>,
}

impl From<&CollabError> for SerializableError {
    fn from(err: &CollabError) -> Self {
        let kind = match err {
            CollabError::Transport(_) => "Transport",
            CollabError::NotConnected(_) => "NotConnected",
            CollabError::SessionAlreadyLive(_) => "SessionAlreadyLive",
            CollabError::MalformedRemoteUpdate(_) => "MalformedRemoteUpdate",
            CollabError::Crdt(_) => "Crdt",
            CollabError::SnapshotDecode { .. } => "SnapshotDecode",
            CollabError::StructuralConflict(_) => "StructuralConflict",
            CollabError::NotFound(_) => "NotFound",
            CollabError::Storage(_) => "Storage",
            CollabError::Json(_) => "Json",
            CollabError::Io(_) => "Io",
            CollabError::FileRead { .. } => "FileRead",
            CollabError::FileWrite { .. } => "FileWrite",
            CollabError::ConfigParse(_) => "ConfigParse",
            CollabError::ConfigSerialize(_) => "ConfigSerialize",
            CollabError::NoConfigDir => "NoConfigDir",
        }
        .to_string();

        let path = match err {
            CollabError::FileRead { path, .. } => Some(path.clone()),
            CollabError::FileWrite { path, .. } => Some(path.clone()),
            _ => None,
        };

        Self {
            kind,
            class: err.class(),
            message: err.to_string(),
            path,
        }
    }
}

impl From<CollabError> for SerializableError {
    fn from(err: CollabError) -> Self {
        SerializableError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            CollabError::Transport("refused".into()).class(),
            ErrorClass::Transport
        );
        assert_eq!(
            CollabError::Crdt("bad update".into()).class(),
            ErrorClass::MalformedRemoteUpdate
        );
        assert_eq!(
            CollabError::StructuralConflict("cycle".into()).class(),
            ErrorClass::StructuralConflict
        );
        assert_eq!(
            CollabError::SnapshotDecode {
                index: 2,
                reason: "eof".into()
            }
            .class(),
            ErrorClass::SnapshotDecode
        );
    }

    #[test]
    fn test_serializable_error() {
        let err = CollabError::SnapshotDecode {
            index: 1,
            reason: "unexpected end of buffer".into(),
        };
        let ser = err.to_serializable();
        assert_eq!(ser.kind, "SnapshotDecode");
        assert_eq!(ser.class, ErrorClass::SnapshotDecode);
        assert!(ser.message.contains("version 1"));
        assert!(ser.path.is_none());
    }
}
