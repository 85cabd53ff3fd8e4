//! Storage abstraction for replica and entity persistence.
//!
//! This module defines the [`Storage`] trait, the persistence collaborator
//! sessions and owners write through: serialized replica bytes, the
//! incremental update log, file/canvas records, and the config key-value
//! store.

use super::types::UpdateOrigin;
use crate::error::CollabError;
use crate::model::{Canvas, File};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, CollabError>;

/// An entry in a document's update log.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredUpdate {
    /// Monotonic update ID
    pub id: i64,
    /// Unix timestamp (milliseconds)
    pub timestamp: i64,
    /// Encoded v1 update
    pub data: Vec<u8>,
    /// Where the update came from
    pub origin: UpdateOrigin,
}

/// Trait for persistence backends.
///
/// # Storage Model
///
/// 1. **Document state**: full encoded replica per room, overwritten on save
/// 2. **Update log**: incremental local updates appended as they happen
/// 3. **Entities**: [`File`] and [`Canvas`] records with tree pointers and versions
/// 4. **Config**: a flat key-value store of JSON values
pub trait Storage: Send + Sync {
    /// Load the full document state as a binary blob.
    ///
    /// Returns `None` if the document doesn't exist.
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the full document state, replacing any existing state and compacting the update log.
    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()>;

    /// Delete a document and all its updates.
    fn delete_doc(&self, name: &str) -> StorageResult<()>;

    /// Append an incremental update to the update log.
    ///
    /// Returns the ID of the newly created update record.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64>;

    /// Get all updates logged since the last full save.
    fn get_updates(&self, name: &str) -> StorageResult<Vec<StoredUpdate>>;

    /// Load a file record.
    fn load_file(&self, id: &str) -> StorageResult<Option<File>>;

    /// Insert or replace a file record.
    fn save_file(&self, file: &File) -> StorageResult<()>;

    /// Load a canvas record.
    fn load_canvas(&self, id: &str) -> StorageResult<Option<Canvas>>;

    /// Insert or replace a canvas record.
    fn save_canvas(&self, canvas: &Canvas) -> StorageResult<()>;

    /// All file records.
    fn list_files(&self) -> StorageResult<Vec<File>>;

    /// All canvas records.
    fn list_canvases(&self) -> StorageResult<Vec<Canvas>>;

    /// Read a config value.
    fn get_config(&self, key: &str) -> StorageResult<Option<serde_json::Value>>;

    /// Write a config value.
    fn set_config(&self, key: &str, value: serde_json::Value) -> StorageResult<()>;
}
