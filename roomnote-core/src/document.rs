use std::fmt;

use serde::{Deserialize, Serialize};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the shared text type every replica edits.
pub const TEXT_NAME: &str = "content";

/// Errors raised by replicated document operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    #[error("Malformed operation: {0}")]
    Malformed(String),
    #[error("Rejected operation: {0}")]
    Rejected(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Malformed(e.to_string())
    }
}

/// Where an operation came from.
///
/// Only used to stop a replica from re-broadcasting what it just received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
}

/// An encoded yrs update tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub origin: Origin,
    pub payload: Vec<u8>,
}

impl Operation {
    pub fn local(payload: Vec<u8>) -> Self {
        Self { origin: Origin::Local, payload }
    }

    pub fn remote(payload: Vec<u8>) -> Self {
        Self { origin: Origin::Remote, payload }
    }
}

/// One replica of a room note.
///
/// Positions and lengths are counted in chars and clamped to the current
/// content, so a stale cursor from the UI never panics inside yrs.
pub struct ReplicatedDocument {
    doc: Doc,
    text: TextRef,
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create a replica with a fixed client id (deterministic tie-breaks in tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    /// Create a replica from a full-state snapshot.
    pub fn from_state(state: &[u8]) -> Result<Self, DocumentError> {
        let doc = Self::new();
        doc.load_full_state(state)?;
        Ok(doc)
    }

    fn from_doc(doc: Doc) -> Self {
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self { doc, text }
    }

    /// Apply an edit made by the local user and return the operation to broadcast.
    ///
    /// Deletion happens before insertion at the same position, so a
    /// replacement is a single operation. Returns `None` for a no-op edit.
    pub fn apply_local_edit(
        &self,
        position: usize,
        deleted_len: usize,
        inserted: &str,
    ) -> Result<Option<Operation>, DocumentError> {
        let current = self.content();
        let char_count = current.chars().count();
        let position = position.min(char_count);
        let deleted_len = deleted_len.min(char_count - position);

        if deleted_len == 0 && inserted.is_empty() {
            return Ok(None);
        }

        let start = byte_offset(&current, position);
        let end = byte_offset(&current, position + deleted_len);
        let start = index_u32(start)?;
        let removed = index_u32(end)? - start;

        let mut txn = self.doc.transact_mut();
        if removed > 0 {
            self.text.remove_range(&mut txn, start, removed);
        }
        if !inserted.is_empty() {
            self.text.insert(&mut txn, start, inserted);
        }
        let payload = txn.encode_update_v1();

        Ok(Some(Operation::local(payload)))
    }

    /// Merge an update produced by another replica.
    ///
    /// Safe to call with updates already applied and in any order.
    /// Malformed bytes are rejected before the document is touched.
    pub fn apply_remote_operation(&self, bytes: &[u8]) -> Result<Operation, DocumentError> {
        let update = match Update::decode_v1(bytes) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping malformed operation ({} bytes): {e}", bytes.len());
                return Err(DocumentError::from(e));
            }
        };

        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| {
            log::warn!("Failed to integrate remote operation: {e}");
            DocumentError::Rejected(e.to_string())
        })?;

        Ok(Operation::remote(bytes.to_vec()))
    }

    /// Encode the full document state (snapshot for sync and persistence).
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a full-state snapshot into this replica.
    pub fn load_full_state(&self, state: &[u8]) -> Result<(), DocumentError> {
        if state.is_empty() {
            return Ok(());
        }
        self.apply_remote_operation(state).map(|_| ())
    }

    /// Encoded state vector of everything this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode every change this replica has that `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Current materialized content.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Content length in chars.
    pub fn len(&self) -> usize {
        self.content().chars().count()
    }

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.text.len(&txn) == 0
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplicatedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content())
    }
}

impl fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("content", &self.content())
            .finish()
    }
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

fn index_u32(index: usize) -> Result<u32, DocumentError> {
    u32::try_from(index).map_err(|_| DocumentError::Rejected(format!("offset {index} out of range")))
}
