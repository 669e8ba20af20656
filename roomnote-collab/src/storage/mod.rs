//! Persistence gateway for room notes.
//!
//! ```text
//! ┌─────────────┐  save_note   ┌──────────────┐
//! │ FileSession │ ───────────► │ dyn NoteStore│
//! │ (client)    │              └──────┬───────┘
//! └─────────────┘                     │
//!                     ┌───────────────┴───────────────┐
//!                     ▼                               ▼
//!            ┌─────────────────┐            ┌──────────────────┐
//!            │ RocksNoteStore  │            │ MemoryNoteStore  │
//!            │ CF "notes"      │            │ HashMap          │
//!            │ CF "note_keys"  │            └──────────────────┘
//!            └─────────────────┘
//! ```
//!
//! Notes are keyed uniquely by `(room_id, title)`. Content is the full
//! encoded document state; the store treats it as opaque bytes and keeps
//! only the latest version.

pub mod memory;
pub mod rocks;

pub use memory::MemoryNoteStore;
pub use rocks::{RocksNoteStore, StoreConfig};

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Store-assigned note id.
pub type RecordId = Uuid;

/// One persisted note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: RecordId,
    pub room_id: String,
    pub title: String,
    pub content: Vec<u8>,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl NoteRecord {
    pub(crate) fn new(room_id: &str, title: &str, content: &[u8]) -> Self {
        let now = unix_now();
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            title: title.to_string(),
            content: content.to_vec(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Note not found: {0}")]
    NotFound(RecordId),
    #[error("Note already exists: {room_id}/{title}")]
    Conflict { room_id: String, title: String },
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable note storage, shared by every client of a process.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn find_by_key(&self, room_id: &str, title: &str) -> Result<Option<NoteRecord>, StoreError>;

    /// Create a note. Fails with [`StoreError::Conflict`] if the key exists.
    async fn insert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError>;

    /// Overwrite the content of an existing note.
    async fn update_content(&self, id: RecordId, content: &[u8]) -> Result<(), StoreError>;

    /// Insert or overwrite by key.
    async fn upsert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError>;

    /// Remove a note. Returns false if it did not exist.
    async fn delete(&self, room_id: &str, title: &str) -> Result<bool, StoreError>;
}

/// Per-client memo of `(room_id, title) → record id`.
#[derive(Debug, Default)]
pub struct RecordCache {
    ids: Mutex<HashMap<(String, String), RecordId>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, room_id: &str, title: &str) -> Option<RecordId> {
        self.ids
            .lock()
            .await
            .get(&(room_id.to_string(), title.to_string()))
            .copied()
    }

    pub async fn put(&self, room_id: &str, title: &str, id: RecordId) {
        self.ids
            .lock()
            .await
            .insert((room_id.to_string(), title.to_string()), id);
    }

    pub async fn forget(&self, room_id: &str, title: &str) {
        self.ids
            .lock()
            .await
            .remove(&(room_id.to_string(), title.to_string()));
    }

    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }
}

/// How [`save_note`] reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Updated(RecordId),
    Inserted(RecordId),
    /// Insert lost a race with another writer and was retried as an update.
    RecoveredConflict(RecordId),
}

impl SaveOutcome {
    pub fn record_id(&self) -> RecordId {
        match self {
            SaveOutcome::Updated(id) | SaveOutcome::Inserted(id) | SaveOutcome::RecoveredConflict(id) => *id,
        }
    }
}

/// Write `content` as the latest version of `(room_id, title)`.
///
/// Cached id → update; otherwise look the key up; found → update, missing
/// → insert. An insert conflict means another client created the note in
/// between, so the record is re-fetched and updated instead.
pub async fn save_note(
    store: &dyn NoteStore,
    cache: &RecordCache,
    room_id: &str,
    title: &str,
    content: &[u8],
) -> Result<SaveOutcome, StoreError> {
    if let Some(id) = cache.get(room_id, title).await {
        match store.update_content(id, content).await {
            Ok(()) => return Ok(SaveOutcome::Updated(id)),
            Err(StoreError::NotFound(_)) => {
                // Deleted behind our back.
                log::debug!("Cached record {id} for {room_id}/{title} is gone");
                cache.forget(room_id, title).await;
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(record) = store.find_by_key(room_id, title).await? {
        store.update_content(record.id, content).await?;
        cache.put(room_id, title, record.id).await;
        return Ok(SaveOutcome::Updated(record.id));
    }

    match store.insert(room_id, title, content).await {
        Ok(id) => {
            cache.put(room_id, title, id).await;
            Ok(SaveOutcome::Inserted(id))
        }
        Err(StoreError::Conflict { .. }) => {
            log::debug!("Insert conflict on {room_id}/{title}, retrying as update");
            let record = store
                .find_by_key(room_id, title)
                .await?
                .ok_or_else(|| StoreError::DatabaseError(format!("{room_id}/{title} vanished after conflict")))?;
            store.update_content(record.id, content).await?;
            cache.put(room_id, title, record.id).await;
            Ok(SaveOutcome::RecoveredConflict(record.id))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Lets a competing writer slip in between lookup and insert.
    struct RacyStore {
        inner: MemoryNoteStore,
        raced: AtomicBool,
    }

    #[async_trait]
    impl NoteStore for RacyStore {
        async fn find_by_key(&self, room_id: &str, title: &str) -> Result<Option<NoteRecord>, StoreError> {
            self.inner.find_by_key(room_id, title).await
        }

        async fn insert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.insert(room_id, title, b"other client").await?;
            }
            self.inner.insert(room_id, title, content).await
        }

        async fn update_content(&self, id: RecordId, content: &[u8]) -> Result<(), StoreError> {
            self.inner.update_content(id, content).await
        }

        async fn upsert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
            self.inner.upsert(room_id, title, content).await
        }

        async fn delete(&self, room_id: &str, title: &str) -> Result<bool, StoreError> {
            self.inner.delete(room_id, title).await
        }
    }

    #[tokio::test]
    async fn test_first_save_inserts_then_updates() {
        let store = MemoryNoteStore::new();
        let cache = RecordCache::new();

        let first = save_note(&store, &cache, "r", "x", b"v1").await.unwrap();
        assert!(matches!(first, SaveOutcome::Inserted(_)));

        let second = save_note(&store, &cache, "r", "x", b"v2").await.unwrap();
        assert_eq!(second, SaveOutcome::Updated(first.record_id()));

        let record = store.find_by_key("r", "x").await.unwrap().unwrap();
        assert_eq!(record.content, b"v2");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_existing_note_found_by_key() {
        let store = MemoryNoteStore::new();
        let id = store.insert("r", "x", b"old").await.unwrap();
        let cache = RecordCache::new();

        let outcome = save_note(&store, &cache, "r", "x", b"new").await.unwrap();
        assert_eq!(outcome, SaveOutcome::Updated(id));
        assert_eq!(cache.get("r", "x").await, Some(id));
    }

    #[tokio::test]
    async fn test_insert_conflict_recovers_as_update() {
        let store = RacyStore {
            inner: MemoryNoteStore::new(),
            raced: AtomicBool::new(false),
        };
        let cache = RecordCache::new();

        let outcome = save_note(&store, &cache, "r", "x", b"mine").await.unwrap();
        assert!(matches!(outcome, SaveOutcome::RecoveredConflict(_)));

        let record = store.find_by_key("r", "x").await.unwrap().unwrap();
        assert_eq!(record.id, outcome.record_id());
        assert_eq!(record.content, b"mine");
    }

    #[tokio::test]
    async fn test_stale_cache_entry_falls_back_to_insert() {
        let store = MemoryNoteStore::new();
        let cache = RecordCache::new();
        let first = save_note(&store, &cache, "r", "x", b"v1").await.unwrap();

        assert!(store.delete("r", "x").await.unwrap());

        let again = save_note(&store, &cache, "r", "x", b"v2").await.unwrap();
        assert!(matches!(again, SaveOutcome::Inserted(_)));
        assert_ne!(again.record_id(), first.record_id());
    }
}
