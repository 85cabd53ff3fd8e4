//! Core types for replica origin tagging.
//!
//! Every transaction a session opens carries an origin. Local edits carry the
//! session's [`ReplicaId`]; updates from the network carry
//! [`REMOTE_ORIGIN`]; state loaded from storage carries [`LOAD_ORIGIN`].
//! Observers classify a transaction with [`UpdateOrigin::classify`] before
//! deriving any local-state change, which is how local echo is suppressed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use yrs::Origin;

/// Origin tag of updates applied from the network.
pub const REMOTE_ORIGIN: &str = "inkboard:remote";

/// Origin tag of state merged in from storage.
pub const LOAD_ORIGIN: &str = "inkboard:load";

/// Identity of one replica (one open session) used as its transaction origin tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// A fresh random replica id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing id.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Transaction origin for local edits made by this replica.
    pub fn origin(&self) -> Origin {
        Origin::from(self.0.as_str())
    }

    /// Whether `origin` is this replica's local tag.
    pub fn is_local(&self, origin: Option<&Origin>) -> bool {
        origin.is_some_and(|o| o.as_ref() == self.0.as_bytes())
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Origin of a replica update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from local user action
    Local,

    /// Update received from a remote peer
    Remote,

    /// State merged in from storage
    Load,

    /// Undo/redo replaying earlier local edits
    UndoRedo,
}

impl UpdateOrigin {
    /// Classify a transaction origin relative to `replica`.
    ///
    /// `undoing` is true while the session is running an undo or redo step;
    /// the undo manager applies those under its own origin.
    pub fn classify(origin: Option<&Origin>, replica: &ReplicaId, undoing: bool) -> Self {
        if replica.is_local(origin) {
            return UpdateOrigin::Local;
        }
        if undoing {
            return UpdateOrigin::UndoRedo;
        }
        match origin {
            Some(o) if o.as_ref() == LOAD_ORIGIN.as_bytes() => UpdateOrigin::Load,
            _ => UpdateOrigin::Remote,
        }
    }
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Load => write!(f, "load"),
            UpdateOrigin::UndoRedo => write!(f, "undo-redo"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "load" => Ok(UpdateOrigin::Load),
            "undo-redo" => Ok(UpdateOrigin::UndoRedo),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

/// Classifies transaction origins for observer callbacks of one session.
///
/// Cheap to clone into closures; shares the session's undo-in-progress flag.
#[derive(Debug, Clone)]
pub struct OriginClassifier {
    replica: ReplicaId,
    undoing: Arc<AtomicBool>,
}

impl OriginClassifier {
    /// Create a classifier for `replica`.
    pub fn new(replica: ReplicaId, undoing: Arc<AtomicBool>) -> Self {
        Self { replica, undoing }
    }

    /// Replica whose transactions count as local.
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Classify a transaction origin.
    pub fn classify(&self, origin: Option<&Origin>) -> UpdateOrigin {
        UpdateOrigin::classify(origin, &self.replica, self.undoing.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_origins() {
        let replica = ReplicaId::new();
        let other = ReplicaId::new();

        let local = replica.origin();
        assert_eq!(
            UpdateOrigin::classify(Some(&local), &replica, false),
            UpdateOrigin::Local
        );
        assert_eq!(
            UpdateOrigin::classify(Some(&other.origin()), &replica, false),
            UpdateOrigin::Remote
        );
        assert_eq!(
            UpdateOrigin::classify(None, &replica, false),
            UpdateOrigin::Remote
        );
        assert_eq!(
            UpdateOrigin::classify(Some(&Origin::from(LOAD_ORIGIN)), &replica, false),
            UpdateOrigin::Load
        );
        assert_eq!(
            UpdateOrigin::classify(None, &replica, true),
            UpdateOrigin::UndoRedo
        );
    }

    #[test]
    fn test_classifier_follows_undo_flag() {
        let replica = ReplicaId::new();
        let undoing = Arc::new(AtomicBool::new(false));
        let classifier = OriginClassifier::new(replica.clone(), Arc::clone(&undoing));

        let undo_origin = Origin::from("undo-manager");
        assert_eq!(classifier.classify(Some(&undo_origin)), UpdateOrigin::Remote);
        undoing.store(true, Ordering::SeqCst);
        assert_eq!(classifier.classify(Some(&undo_origin)), UpdateOrigin::UndoRedo);
        assert_eq!(
            classifier.classify(Some(&replica.origin())),
            UpdateOrigin::Local
        );
    }

    #[test]
    fn test_update_origin_round_trip() {
        for origin in [
            UpdateOrigin::Local,
            UpdateOrigin::Remote,
            UpdateOrigin::Load,
            UpdateOrigin::UndoRedo,
        ] {
            assert_eq!(origin.to_string().parse::<UpdateOrigin>().unwrap(), origin);
        }
        assert!("bogus".parse::<UpdateOrigin>().is_err());
    }
}
