//! Per-file sync state held by a [`SyncClient`](crate::client::SyncClient).
//!
//! A [`FileSession`] owns the local replica of one `(room, file)` pair and
//! the bookkeeping around it: connection phase, pending broadcast window,
//! debounce timers and save accounting. It does no I/O itself; the client
//! task drives it and performs the sends and store writes it asks for.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use roomnote_core::{DocumentError, Operation, ReplicatedDocument};

use crate::scheduler::TaskSlot;

/// `(room_id, file_name)`.
pub type FileKey = (String, String);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection phase of one open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// No transport; edits stay local
    Disconnected,
    /// Transport up, join being sent
    Connecting,
    /// Joined, waiting for peer state or the sync timeout
    AwaitingSync,
    /// Caught up
    Live,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileState::Disconnected => "disconnected",
            FileState::Connecting => "connecting",
            FileState::AwaitingSync => "awaiting-sync",
            FileState::Live => "live",
        };
        f.write_str(name)
    }
}

/// A snapshot to write to the store.
#[derive(Debug, Clone)]
pub struct SaveJob {
    /// Full encoded document state (what gets persisted)
    pub state: Vec<u8>,
    /// Materialized text at snapshot time (what the dirty check compares)
    pub text: String,
    /// The replica has not seen the stored note yet; merge it before writing
    pub merge_stored: bool,
}

/// What a save request turned into.
#[derive(Debug)]
pub enum SaveDecision {
    Start(SaveJob),
    /// Another save is in flight; re-evaluated when it finishes
    Deferred,
    /// Neither a peer nor the store has been merged yet
    Unsynced,
    /// Content equals the last saved text
    Clean,
}

/// Local replica plus sync bookkeeping for one open file.
#[derive(Debug)]
pub struct FileSession {
    id: u64,
    room_id: String,
    file_name: String,
    doc: ReplicatedDocument,
    state: FileState,
    /// State vector before the first unsent local edit
    broadcast_since: Option<Vec<u8>>,
    pub(crate) broadcast_timer: TaskSlot,
    pub(crate) save_timer: TaskSlot,
    pub(crate) sync_timer: TaskSlot,
    saves_in_flight: usize,
    save_deferred: bool,
    last_saved: Option<String>,
    /// Peer state or the stored note has been merged
    synced: bool,
    persisted_loading: bool,
    last_error: Option<String>,
}

impl FileSession {
    pub fn new(room_id: &str, file_name: &str) -> Self {
        Self::with_document(room_id, file_name, ReplicatedDocument::new())
    }

    pub fn with_document(room_id: &str, file_name: &str, doc: ReplicatedDocument) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            room_id: room_id.to_string(),
            file_name: file_name.to_string(),
            doc,
            state: FileState::Disconnected,
            broadcast_since: None,
            broadcast_timer: TaskSlot::new(),
            save_timer: TaskSlot::new(),
            sync_timer: TaskSlot::new(),
            saves_in_flight: 0,
            save_deferred: false,
            last_saved: None,
            synced: false,
            persisted_loading: false,
            last_error: None,
        }
    }

    /// Unique per open; a reopened file gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn key(&self) -> FileKey {
        (self.room_id.clone(), self.file_name.clone())
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// Returns true if the state changed.
    pub fn set_state(&mut self, state: FileState) -> bool {
        if self.state == state {
            return false;
        }
        log::debug!("{}/{}: {} -> {}", self.room_id, self.file_name, self.state, state);
        self.state = state;
        true
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.doc
    }

    pub fn content(&self) -> String {
        self.doc.content()
    }

    pub fn error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Apply a UI edit. Opens a broadcast window if none is pending.
    pub fn apply_local_edit(
        &mut self,
        position: usize,
        deleted_len: usize,
        inserted: &str,
    ) -> Result<Option<Operation>, DocumentError> {
        let before = self.doc.state_vector();
        let op = self.doc.apply_local_edit(position, deleted_len, inserted)?;
        if op.is_some() && self.broadcast_since.is_none() {
            self.broadcast_since = Some(before);
        }
        Ok(op)
    }

    /// Merge a peer's update. Returns whether the visible text changed.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<bool, DocumentError> {
        let before = self.doc.content();
        match self.doc.apply_remote_operation(bytes) {
            Ok(_) => {
                self.last_error = None;
                Ok(self.doc.content() != before)
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Merge a persisted snapshot and adopt its text as the saved baseline.
    pub fn apply_persisted(&mut self, state: &[u8]) -> Result<bool, DocumentError> {
        let before = self.doc.content();
        self.doc.load_full_state(state)?;
        let after = self.doc.content();
        if self.last_saved.is_none() {
            self.last_saved = Some(after.clone());
        }
        self.mark_synced();
        Ok(after != before)
    }

    /// Start a store load. Returns false if the replica is already synced
    /// or a load is running.
    pub fn request_persisted(&mut self) -> bool {
        if self.synced || self.persisted_loading {
            return false;
        }
        self.persisted_loading = true;
        true
    }

    /// The store load failed; a later request may retry it.
    pub fn persisted_failed(&mut self) {
        self.persisted_loading = false;
    }

    /// The replica now holds everything the room or the store had.
    pub fn mark_synced(&mut self) {
        self.synced = true;
        self.persisted_loading = false;
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    // ─── Broadcast ────────────────────────────────────────────────────

    pub fn has_unsent_edits(&self) -> bool {
        self.broadcast_since.is_some()
    }

    /// Diff of every local edit since the window opened; closes the window.
    pub fn take_broadcast_diff(&mut self) -> Result<Option<Vec<u8>>, DocumentError> {
        match self.broadcast_since.take() {
            Some(since) => Ok(Some(self.doc.encode_diff(&since)?)),
            None => Ok(None),
        }
    }

    /// Forget the pending window (a full-state push superseded it).
    pub fn clear_broadcast(&mut self) {
        self.broadcast_since = None;
        self.broadcast_timer.cancel();
    }

    pub fn full_state(&self) -> Vec<u8> {
        self.doc.encode_full_state()
    }

    // ─── Saves ────────────────────────────────────────────────────────

    pub fn is_dirty(&self) -> bool {
        self.doc.content() != self.last_saved.as_deref().unwrap_or("")
    }

    pub fn saves_in_flight(&self) -> usize {
        self.saves_in_flight
    }

    pub fn last_saved(&self) -> Option<&str> {
        self.last_saved.as_deref()
    }

    /// Decide what a save request does now.
    ///
    /// A non-forced request waits until the replica is synced and for any
    /// in-flight save. A forced one never waits; before sync its job asks
    /// the writer to merge the stored note so the write cannot drop it.
    pub fn begin_save(&mut self, forced: bool) -> SaveDecision {
        if !forced && !self.synced {
            return SaveDecision::Unsynced;
        }
        if !forced && self.saves_in_flight > 0 {
            self.save_deferred = true;
            return SaveDecision::Deferred;
        }
        if !self.is_dirty() {
            return SaveDecision::Clean;
        }
        self.saves_in_flight += 1;
        SaveDecision::Start(SaveJob {
            state: self.doc.encode_full_state(),
            text: self.doc.content(),
            merge_stored: !self.synced,
        })
    }

    /// Record a finished save. Returns true when a deferred request should run now.
    pub fn finish_save(&mut self, text: String, succeeded: bool) -> bool {
        self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
        if succeeded {
            self.last_saved = Some(text);
        }
        if self.saves_in_flight == 0 && self.save_deferred {
            self.save_deferred = false;
            return true;
        }
        false
    }

    /// Abort every timer of this session.
    pub fn cancel_timers(&mut self) {
        self.broadcast_timer.cancel();
        self.save_timer.cancel();
        self.sync_timer.cancel();
    }
}
