//! Test utilities for inkboard_core
//!
//! Shared helpers for session tests: a context wired to a [`MemoryHub`] and a
//! recording editing view.

use std::sync::{Arc, Mutex};

use yrs::{GetString, Transact};

use crate::config::Config;
use crate::crdt::{
    EditorView, ReplicatedDocumentSession, SessionContext, SharedRoomIndicator, ViewDocument,
    ViewTransaction,
};
use crate::error::{CollabError, Result};
use crate::presence::PresenceChannel;
use crate::transport::MemoryHub;

/// A fresh context (own presence channel, default config) on `hub`.
pub fn session_context(hub: &MemoryHub) -> SessionContext {
    SessionContext {
        transport: Arc::new(hub.clone()),
        presence: Arc::new(PresenceChannel::new(rand::random::<u32>() as u64)),
        config: Config::default().into_shared(),
        indicator: Arc::new(SharedRoomIndicator::new()),
        storage: None,
    }
}

/// Current content of the shared text `name`.
pub fn text_of(session: &ReplicatedDocumentSession, name: &str) -> String {
    let text = session.doc().get_or_insert_text(name);
    let txn = session.doc().transact();
    text.get_string(&txn)
}

/// An editing view that records every dispatched transaction.
///
/// Accepted transactions replace the shown document, like a real view would.
pub struct RecordingView {
    document: Mutex<ViewDocument>,
    dispatched: Mutex<Vec<ViewTransaction>>,
    reject: Mutex<bool>,
}

impl RecordingView {
    /// A view showing `doc`.
    pub fn new(doc: ViewDocument) -> Self {
        Self {
            document: Mutex::new(doc),
            dispatched: Mutex::new(Vec::new()),
            reject: Mutex::new(false),
        }
    }

    /// Simulate the user typing: replace the shown document without a dispatch.
    pub fn set_document(&self, doc: ViewDocument) {
        *self.document.lock().unwrap() = doc;
    }

    /// Every transaction accepted so far.
    pub fn dispatched(&self) -> Vec<ViewTransaction> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Make the view refuse every following dispatch.
    pub fn reject_dispatch(&self, reject: bool) {
        *self.reject.lock().unwrap() = reject;
    }
}

impl EditorView for RecordingView {
    fn document(&self) -> ViewDocument {
        self.document.lock().unwrap().clone()
    }

    fn dispatch(&self, tr: ViewTransaction) -> Result<()> {
        if *self.reject.lock().unwrap() {
            return Err(CollabError::MalformedRemoteUpdate(
                "view cannot represent the document".into(),
            ));
        }
        *self.document.lock().unwrap() = tr.doc.clone();
        self.dispatched.lock().unwrap().push(tr);
        Ok(())
    }
}
