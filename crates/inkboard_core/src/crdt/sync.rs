//! Y-sync protocol implementation (y-websocket compatible).
//!
//! This module provides the wire layer sessions use to talk to a relay or
//! directly to peers. It handles Y-sync message encoding/decoding, the
//! state handshake, and framing of awareness updates.
//!
//! # Protocol Overview
//!
//! The Y-sync protocol uses a two-phase handshake:
//!
//! 1. **SyncStep1**: A peer sends its state vector
//! 2. **SyncStep2**: The other side responds with missing updates
//!
//! After the handshake, updates are exchanged bidirectionally.
//!
//! # Wire Format (y-protocols compatible)
//!
//! Messages use varUint encoding (variable-length unsigned integers):
//! - `varUint(0)`: Sync message type
//!   - `varUint(0)`: SyncStep1 - contains state vector
//!   - `varUint(1)`: SyncStep2 - contains missing updates
//!   - `varUint(2)`: Update - contains incremental update
//! - `varUint(1)`: Awareness message - contains an awareness update
//!
//! Byte arrays are encoded as: `varUint(length) + raw bytes`

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::error::{CollabError, Result};

// ===========================================================================
// VarUint encoding/decoding (y-protocols compatible)
// ===========================================================================

/// Write a variable-length unsigned integer to a buffer.
/// Uses 7 bits per byte, with MSB indicating continuation.
pub(crate) fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80; // Set continuation bit
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Read a variable-length unsigned integer from a buffer.
/// Returns (value, bytes_consumed) or None if buffer is too short.
pub(crate) fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None; // Overflow
        }
    }
    None // Incomplete
}

/// Write a byte array with length prefix (varUint encoding).
pub(crate) fn write_var_byte_array(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read a byte array with length prefix.
/// Returns (data, bytes_consumed) or None if buffer is too short.
pub(crate) fn read_var_byte_array(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let (len, len_bytes) = read_var_uint(data)?;
    let len = len as usize;
    let total = len_bytes.checked_add(len)?;
    if data.len() < total {
        return None;
    }
    Some((data[len_bytes..total].to_vec(), total))
}

/// Write a UTF-8 string with length prefix.
pub(crate) fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_byte_array(buf, s.as_bytes());
}

/// Read a UTF-8 string with length prefix.
pub(crate) fn read_var_string(data: &[u8]) -> Option<(String, usize)> {
    let (bytes, consumed) = read_var_byte_array(data)?;
    String::from_utf8(bytes).ok().map(|s| (s, consumed))
}

/// Message type bytes for the Y-sync protocol.
mod msg_type {
    /// Sync message (SyncStep1, SyncStep2, Update)
    pub const SYNC: u64 = 0;
    /// Awareness message
    pub const AWARENESS: u64 = 1;
}

/// Sync sub-message types.
mod sync_type {
    /// SyncStep1: Initial state vector exchange
    pub const STEP1: u64 = 0;
    /// SyncStep2: Missing updates response
    pub const STEP2: u64 = 1;
    /// Update: Incremental update
    pub const UPDATE: u64 = 2;
}

/// Y-sync message types.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// SyncStep1 contains a state vector
    SyncStep1(Vec<u8>),
    /// SyncStep2 contains missing updates
    SyncStep2(Vec<u8>),
    /// Update contains an incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    /// Encode the message to bytes using y-protocols compatible format.
    /// Format: varUint(msgType) + varUint(syncType) + varByteArray(payload)
    pub fn encode(&self) -> Vec<u8> {
        Self::encode_batch(std::slice::from_ref(self))
    }

    /// Encode several sub-messages as one sync message (message type written once).
    pub fn encode_batch(messages: &[SyncMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_uint(&mut buf, msg_type::SYNC);
        for message in messages {
            message.encode_sub_message(&mut buf);
        }
        buf
    }

    fn encode_sub_message(&self, buf: &mut Vec<u8>) {
        let (kind, payload, name) = match self {
            SyncMessage::SyncStep1(sv) => (sync_type::STEP1, sv, "SyncStep1"),
            SyncMessage::SyncStep2(update) => (sync_type::STEP2, update, "SyncStep2"),
            SyncMessage::Update(update) => (sync_type::UPDATE, update, "Update"),
        };
        log::debug!("[Y-sync] Encoding {}, {} bytes", name, payload.len());
        write_var_uint(buf, kind);
        write_var_byte_array(buf, payload);
    }

    /// Decode a sync sub-message (sync_type + payload) without the message type prefix.
    /// Returns (Option<message>, bytes_consumed); `None` with 0 bytes means incomplete.
    fn decode_sub_message(data: &[u8]) -> Result<(Option<Self>, usize)> {
        if data.is_empty() {
            return Ok((None, 0));
        }

        let Some((sync_type_val, sync_type_bytes)) = read_var_uint(data) else {
            log::debug!("[Y-sync] Incomplete sync type");
            return Ok((None, 0));
        };

        let Some((payload, payload_bytes)) = read_var_byte_array(&data[sync_type_bytes..]) else {
            log::debug!("[Y-sync] Incomplete payload");
            return Ok((None, 0));
        };

        let msg = match sync_type_val {
            sync_type::STEP1 => SyncMessage::SyncStep1(payload),
            sync_type::STEP2 => SyncMessage::SyncStep2(payload),
            sync_type::UPDATE => SyncMessage::Update(payload),
            other => {
                return Err(CollabError::MalformedRemoteUpdate(format!(
                    "Unknown sync type: {}",
                    other
                )));
            }
        };

        Ok((Some(msg), sync_type_bytes + payload_bytes))
    }
}

/// A decoded top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// One or more sync sub-messages (a relay may combine SyncStep2 + SyncStep1).
    Sync(Vec<SyncMessage>),
    /// An awareness update payload.
    Awareness(Vec<u8>),
}

impl Message {
    /// Decode a message received from the transport.
    ///
    /// Returns `Ok(None)` for empty frames and message types this crate does not handle.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        log::debug!(
            "[Y-sync] Decoding message, {} bytes, first 20: {:?}",
            data.len(),
            &data[..data.len().min(20)]
        );

        if data.is_empty() {
            return Ok(None);
        }

        let Some((kind, kind_bytes)) = read_var_uint(data) else {
            return Err(CollabError::MalformedRemoteUpdate(
                "incomplete message type".into(),
            ));
        };

        match kind {
            msg_type::SYNC => {
                let mut messages = Vec::new();
                let mut offset = kind_bytes;
                while offset < data.len() {
                    let (msg, consumed) = SyncMessage::decode_sub_message(&data[offset..])?;
                    if consumed == 0 {
                        break;
                    }
                    if let Some(m) = msg {
                        messages.push(m);
                    }
                    offset += consumed;
                }
                if messages.is_empty() {
                    return Err(CollabError::MalformedRemoteUpdate(
                        "sync message without a complete sub-message".into(),
                    ));
                }
                log::debug!("[Y-sync] Decoded {} sub-messages", messages.len());
                Ok(Some(Message::Sync(messages)))
            }
            msg_type::AWARENESS => {
                let Some((payload, _)) = read_var_byte_array(&data[kind_bytes..]) else {
                    return Err(CollabError::MalformedRemoteUpdate(
                        "incomplete awareness payload".into(),
                    ));
                };
                Ok(Some(Message::Awareness(payload)))
            }
            other => {
                log::debug!("[Y-sync] Ignoring message type {}", other);
                Ok(None)
            }
        }
    }

    /// Frame an awareness update for the wire.
    pub fn encode_awareness(update: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(update.len() + 6);
        write_var_uint(&mut buf, msg_type::AWARENESS);
        write_var_byte_array(&mut buf, update);
        buf
    }
}

/// Result of handling one batch of sync sub-messages.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Reply to send back through the transport, if any
    pub response: Option<Vec<u8>>,
    /// A SyncStep2 was applied: the replica has caught up with the sender
    pub synced: bool,
}

/// Sync protocol handler for one replica.
///
/// Remote updates are applied in transactions tagged with `remote_origin`, so
/// the session's outgoing-update observer can skip re-broadcasting them.
pub struct SyncProtocol {
    doc: Doc,
    remote_origin: Origin,
}

impl SyncProtocol {
    /// Create a handler for `doc`, tagging applied remote updates with `remote_origin`.
    pub fn new(doc: Doc, remote_origin: Origin) -> Self {
        Self { doc, remote_origin }
    }

    /// Encode the local state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Create a SyncStep1 message containing the local state vector.
    pub fn create_sync_step1(&self) -> Vec<u8> {
        SyncMessage::SyncStep1(self.state_vector()).encode()
    }

    /// Create a SyncStep2 message with updates the remote peer is missing.
    pub fn create_sync_step2(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        Ok(SyncMessage::SyncStep2(self.diff_since(remote_state_vector)?).encode())
    }

    fn diff_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector).map_err(|e| {
            CollabError::MalformedRemoteUpdate(format!("Failed to decode state vector: {}", e))
        })?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Create an update message for broadcasting local changes.
    pub fn create_update_message(&self, update: &[u8]) -> Vec<u8> {
        SyncMessage::Update(update.to_vec()).encode()
    }

    /// Apply a remote update under the remote origin tag.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let update = Update::decode_v1(update).map_err(|e| {
            CollabError::MalformedRemoteUpdate(format!("Failed to decode update: {}", e))
        })?;
        let mut txn = self.doc.transact_mut_with(self.remote_origin.clone());
        txn.apply_update(update)
            .map_err(|e| CollabError::MalformedRemoteUpdate(format!("Failed to apply update: {}", e)))
    }

    /// Handle decoded sync sub-messages from a remote peer.
    ///
    /// # Message Types
    ///
    /// - **SyncStep1**: Replies with a SyncStep2. A SyncStep1 that opens a
    ///   handshake (no SyncStep2 in the same batch) also gets our own
    ///   SyncStep1, so both sides catch up over a plain relay. A SyncStep1
    ///   that answers ours only gets the SyncStep2, which ends the exchange.
    /// - **SyncStep2**: Applies the update and marks the replica synced
    /// - **Update**: Applies the update
    pub fn handle(&self, messages: Vec<SyncMessage>) -> Result<SyncOutcome> {
        let mut outcome = SyncOutcome::default();
        let mut replies = Vec::new();
        let opens_handshake = !messages
            .iter()
            .any(|m| matches!(m, SyncMessage::SyncStep2(_)));

        for sync_msg in messages {
            match sync_msg {
                SyncMessage::SyncStep1(remote_sv) => {
                    replies.push(SyncMessage::SyncStep2(self.diff_since(&remote_sv)?));
                    if opens_handshake {
                        replies.push(SyncMessage::SyncStep1(self.state_vector()));
                    }
                }
                SyncMessage::SyncStep2(update) => {
                    if !update.is_empty() {
                        log::debug!("[Y-sync] Applying SyncStep2 update, {} bytes", update.len());
                        self.apply_update(&update)?;
                    }
                    outcome.synced = true;
                }
                SyncMessage::Update(update) => {
                    if !update.is_empty() {
                        log::debug!("[Y-sync] Applying Update, {} bytes", update.len());
                        self.apply_update(&update)?;
                    }
                }
            }
        }

        if !replies.is_empty() {
            outcome.response = Some(SyncMessage::encode_batch(&replies));
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for SyncProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("remote_origin", &self.remote_origin)
            .finish_non_exhaustive()
    }
}
