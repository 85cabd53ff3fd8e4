//! In-memory storage implementation.
//!
//! This provides a simple in-memory implementation of [`Storage`]
//! for use in tests, demos, and as the default for unsaved workspaces.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use super::storage::{Storage, StorageResult, StoredUpdate};
use super::types::UpdateOrigin;
use crate::model::{Canvas, File, now_millis};

/// In-memory storage.
///
/// This implementation stores all data in memory using maps and vectors.
/// It's thread-safe via `RwLock` but data is lost when dropped. Files and
/// canvases are listed in insertion order.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Document snapshots (name -> binary state)
    docs: Arc<RwLock<HashMap<String, Vec<u8>>>>,

    /// Update logs (name -> list of updates)
    updates: Arc<RwLock<HashMap<String, Vec<StoredUpdate>>>>,

    files: Arc<RwLock<IndexMap<String, File>>>,

    canvases: Arc<RwLock<IndexMap<String, Canvas>>>,

    config: Arc<RwLock<HashMap<String, serde_json::Value>>>,

    /// Counter for generating update IDs
    next_id: Arc<RwLock<i64>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap();
        *id += 1;
        *id
    }
}

impl Storage for MemoryStorage {
    fn load_doc(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        let mut updates = self.updates.write().unwrap();
        docs.insert(name.to_string(), state.to_vec());
        updates.remove(name);
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        let mut updates = self.updates.write().unwrap();
        docs.remove(name);
        updates.remove(name);
        Ok(())
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64> {
        let id = self.next_update_id();
        let mut updates = self.updates.write().unwrap();
        updates
            .entry(name.to_string())
            .or_default()
            .push(StoredUpdate {
                id,
                timestamp: now_millis(),
                data: update.to_vec(),
                origin,
            });
        Ok(id)
    }

    fn get_updates(&self, name: &str) -> StorageResult<Vec<StoredUpdate>> {
        let updates = self.updates.read().unwrap();
        Ok(updates.get(name).cloned().unwrap_or_default())
    }

    fn load_file(&self, id: &str) -> StorageResult<Option<File>> {
        Ok(self.files.read().unwrap().get(id).cloned())
    }

    fn save_file(&self, file: &File) -> StorageResult<()> {
        self.files
            .write()
            .unwrap()
            .insert(file.id.clone(), file.clone());
        Ok(())
    }

    fn load_canvas(&self, id: &str) -> StorageResult<Option<Canvas>> {
        Ok(self.canvases.read().unwrap().get(id).cloned())
    }

    fn save_canvas(&self, canvas: &Canvas) -> StorageResult<()> {
        self.canvases
            .write()
            .unwrap()
            .insert(canvas.id.clone(), canvas.clone());
        Ok(())
    }

    fn list_files(&self) -> StorageResult<Vec<File>> {
        Ok(self.files.read().unwrap().values().cloned().collect())
    }

    fn list_canvases(&self) -> StorageResult<Vec<Canvas>> {
        Ok(self.canvases.read().unwrap().values().cloned().collect())
    }

    fn get_config(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        Ok(self.config.read().unwrap().get(key).cloned())
    }

    fn set_config(&self, key: &str, value: serde_json::Value) -> StorageResult<()> {
        self.config.write().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_and_load_doc() {
        let storage = MemoryStorage::new();
        storage.save_doc("test", &[1, 2, 3]).unwrap();
        assert_eq!(storage.load_doc("test").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.load_doc("missing").unwrap(), None);
    }

    #[test]
    fn test_update_log_compacted_by_save() {
        let storage = MemoryStorage::new();
        let id1 = storage
            .append_update("doc", &[1], UpdateOrigin::Local)
            .unwrap();
        let id2 = storage
            .append_update("doc", &[2], UpdateOrigin::Local)
            .unwrap();
        assert!(id2 > id1);
        assert_eq!(storage.get_updates("doc").unwrap().len(), 2);

        storage.save_doc("doc", &[1, 2]).unwrap();
        assert!(storage.get_updates("doc").unwrap().is_empty());
    }

    #[test]
    fn test_delete_doc() {
        let storage = MemoryStorage::new();
        storage.save_doc("doc", &[1]).unwrap();
        storage
            .append_update("doc", &[2], UpdateOrigin::Local)
            .unwrap();
        storage.delete_doc("doc").unwrap();
        assert!(storage.load_doc("doc").unwrap().is_none());
        assert!(storage.get_updates("doc").unwrap().is_empty());
    }

    #[test]
    fn test_entities_keep_insertion_order() {
        let storage = MemoryStorage::new();
        for id in ["c", "a", "b"] {
            storage
                .save_file(&File {
                    id: id.into(),
                    ..Default::default()
                })
                .unwrap();
        }
        let ids: Vec<String> = storage
            .list_files()
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_config_store() {
        let storage = MemoryStorage::new();
        storage.set_config("fontSize", json!(16)).unwrap();
        assert_eq!(storage.get_config("fontSize").unwrap(), Some(json!(16)));
        assert_eq!(storage.get_config("font").unwrap(), None);
    }
}
