//! Point-in-time versions of a document.
//!
//! A version is a causal [`Snapshot`] of the replica plus a date and the id
//! of the replica that captured it. Versions live in the replica's
//! `versions` array, so they replicate with the document and are persisted
//! with it; [`File::versions`] is their materialization for the persistence
//! collaborator. The array is only ever appended to.
//!
//! Rendering a version projects it through the [`EditorBinding`] without
//! touching the live replica. Applying one replaces the live content as a
//! new local edit, so history keeps growing and the apply can be undone.

use std::collections::HashMap;
use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, ArrayRef, Out, ReadTxn, Snapshot, Transact};

use super::editor_binding::{EditorBinding, SharedContent, ViewDocument};
use super::session::ReplicatedDocumentSession;
use crate::error::{CollabError, Result};
use crate::model::{File, Version, now_millis};

/// Name of the shared version array.
pub const VERSIONS_ARRAY: &str = "versions";

const DATE_FIELD: &str = "date";
const SNAPSHOT_FIELD: &str = "snapshot";
const REPLICA_FIELD: &str = "replica";
const CLIENT_FIELD: &str = "client";

/// Version history of one session's document content.
pub struct SnapshotVersioning<'a> {
    session: &'a ReplicatedDocumentSession,
    content: SharedContent,
    versions: ArrayRef,
}

impl<'a> SnapshotVersioning<'a> {
    /// Versions of `content` in the session's replica.
    pub fn new(session: &'a ReplicatedDocumentSession, content: SharedContent) -> Self {
        let versions = session.doc().get_or_insert_array(VERSIONS_ARRAY);
        Self {
            session,
            content,
            versions,
        }
    }

    /// Number of stored entries, including undecodable ones.
    pub fn len(&self) -> u32 {
        let txn = self.session.doc().transact();
        self.versions.len(&txn)
    }

    /// Whether no version was ever captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture the current state as a new version.
    ///
    /// Returns `None` without storing anything when the replica has not
    /// changed since the last version was stored. Any edit counts, even one
    /// that was later reverted.
    pub fn add_version(&self) -> Result<Option<Version>> {
        let (snapshot, previous) = {
            let txn = self.session.doc().transact();
            let previous = match self.versions.len(&txn) {
                0 => None,
                len => Some((len as usize - 1, self.versions.get(&txn, len - 1))),
            };
            (txn.snapshot(), previous)
        };

        if let Some((index, Some(entry))) = previous {
            match stored_snapshot(index, entry) {
                Ok(previous) if previous == snapshot => {
                    log::debug!("[Versions] Nothing changed since version {}, skipping", index);
                    return Ok(None);
                }
                Ok(_) => {}
                Err(e) => log::warn!("[Versions] {}", e),
            }
        }

        let version = Version {
            date: now_millis(),
            snapshot: snapshot.encode_v1(),
            replica: self.session.replica_id().to_string(),
            client_id: self.session.doc().client_id(),
        };
        {
            let mut txn = self.session.doc().transact_mut_with(self.session.local_origin());
            self.versions.push_back(&mut txn, version_to_any(&version));
        }
        log::info!(
            "[Versions] Saved version {} of {}",
            self.len(),
            self.session.room()
        );
        Ok(Some(version))
    }

    /// Decodable versions, oldest first. Corrupt entries are logged and skipped.
    pub fn versions(&self) -> Vec<Version> {
        let txn = self.session.doc().transact();
        self.versions
            .iter(&txn)
            .enumerate()
            .filter_map(|(index, entry)| match decodable(index, entry) {
                Ok(version) => Some(version),
                Err(e) => {
                    log::warn!("[Versions] {}", e);
                    None
                }
            })
            .collect()
    }

    /// Show `version` read-only in the binding's view.
    pub fn render_version(&self, binding: &EditorBinding, version: &Version) -> Result<()> {
        let snapshot = self.decode(version)?;
        binding.render_snapshot(&snapshot)
    }

    /// Return the binding's view to live editing.
    pub fn unrender_version(&self, binding: &EditorBinding) -> Result<()> {
        binding.clear_snapshot()
    }

    /// Replace the live content with the content at `version`.
    ///
    /// This is a new undoable local edit; stored versions are untouched.
    pub fn apply_version(&self, binding: &EditorBinding, version: &Version) -> Result<()> {
        let snapshot = self.decode(version)?;
        let past = binding.content().materialize_at(self.session.doc(), &snapshot)?;
        self.session.new_undo_step();
        binding.restore(past)?;
        self.session.new_undo_step();
        log::info!(
            "[Versions] Applied version from {} to {}",
            version.date,
            self.session.room()
        );
        Ok(())
    }

    /// Content at `version`, without a view.
    pub fn content_at(&self, version: &Version) -> Result<ViewDocument> {
        let snapshot = self.decode(version)?;
        self.content.materialize_at(self.session.doc(), &snapshot)
    }

    /// Mirror the stored versions into `file`.
    pub fn save_to(&self, file: &mut File) {
        file.versions = self.versions();
    }

    fn decode(&self, version: &Version) -> Result<Snapshot> {
        Snapshot::decode_v1(&version.snapshot).map_err(|e| CollabError::SnapshotDecode {
            index: self.position(version),
            reason: e.to_string(),
        })
    }

    /// Index of `version` in the array, or the array length if it is not stored.
    fn position(&self, version: &Version) -> usize {
        let txn = self.session.doc().transact();
        let len = self.versions.len(&txn) as usize;
        self.versions
            .iter(&txn)
            .enumerate()
            .find_map(|(index, entry)| match version_from_out(index, entry) {
                Ok(stored) if stored == *version => Some(index),
                _ => None,
            })
            .unwrap_or(len)
    }

}

/// Snapshot of a stored entry, advanced past the push that stored it.
///
/// Storing an entry bumps the storing client's clock by one; with that
/// accounted for, an unchanged replica has a snapshot equal to this one.
fn stored_snapshot(index: usize, entry: Out) -> Result<Snapshot> {
    let version = version_from_out(index, entry)?;
    let mut snapshot = decode_snapshot(index, &version.snapshot)?;
    let clock = snapshot.state_map.get(&version.client_id);
    snapshot.state_map.set_max(version.client_id, clock + 1);
    Ok(snapshot)
}

fn decode_snapshot(index: usize, bytes: &[u8]) -> Result<Snapshot> {
    Snapshot::decode_v1(bytes).map_err(|e| CollabError::SnapshotDecode {
        index,
        reason: e.to_string(),
    })
}

/// A stored entry whose snapshot decodes.
fn decodable(index: usize, entry: Out) -> Result<Version> {
    let version = version_from_out(index, entry)?;
    decode_snapshot(index, &version.snapshot)?;
    Ok(version)
}

fn version_to_any(version: &Version) -> Any {
    let mut fields = HashMap::new();
    fields.insert(DATE_FIELD.to_string(), Any::Number(version.date as f64));
    fields.insert(
        SNAPSHOT_FIELD.to_string(),
        Any::Buffer(version.snapshot.clone().into()),
    );
    fields.insert(REPLICA_FIELD.to_string(), Any::String(version.replica.as_str().into()));
    fields.insert(CLIENT_FIELD.to_string(), Any::Number(version.client_id as f64));
    Any::Map(Arc::new(fields))
}

fn version_from_out(index: usize, entry: Out) -> Result<Version> {
    let malformed = |reason: &str| CollabError::SnapshotDecode {
        index,
        reason: reason.to_string(),
    };
    let Out::Any(Any::Map(fields)) = entry else {
        return Err(malformed("entry is not a map"));
    };
    let date = match fields.get(DATE_FIELD) {
        Some(Any::Number(date)) => *date as i64,
        Some(Any::BigInt(date)) => *date,
        _ => return Err(malformed("missing date")),
    };
    let snapshot = match fields.get(SNAPSHOT_FIELD) {
        Some(Any::Buffer(bytes)) => bytes.to_vec(),
        _ => return Err(malformed("missing snapshot bytes")),
    };
    let replica = match fields.get(REPLICA_FIELD) {
        Some(Any::String(replica)) => replica.to_string(),
        _ => String::new(),
    };
    let client_id = match fields.get(CLIENT_FIELD) {
        Some(Any::Number(client)) => *client as u64,
        Some(Any::BigInt(client)) => *client as u64,
        _ => return Err(malformed("missing client id")),
    };
    Ok(Version {
        date,
        snapshot,
        replica,
        client_id,
    })
}
