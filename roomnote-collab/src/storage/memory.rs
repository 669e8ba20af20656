//! In-process note store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{unix_now, NoteRecord, NoteStore, RecordId, StoreError};

#[derive(Debug, Default)]
struct Tables {
    notes: HashMap<RecordId, NoteRecord>,
    keys: HashMap<(String, String), RecordId>,
}

/// `HashMap`-backed [`NoteStore`].
///
/// Counts successful writes so callers can assert how often content
/// actually reached storage. [`set_unavailable`](Self::set_unavailable)
/// makes every call fail, for exercising retry paths.
#[derive(Debug, Default)]
pub struct MemoryNoteStore {
    tables: RwLock<Tables>,
    writes: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful insert/update/upsert calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.notes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn find_by_key(&self, room_id: &str, title: &str) -> Result<Option<NoteRecord>, StoreError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .keys
            .get(&(room_id.to_string(), title.to_string()))
            .and_then(|id| tables.notes.get(id))
            .cloned())
    }

    async fn insert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let key = (room_id.to_string(), title.to_string());
        if tables.keys.contains_key(&key) {
            return Err(StoreError::Conflict {
                room_id: room_id.to_string(),
                title: title.to_string(),
            });
        }
        let record = NoteRecord::new(room_id, title, content);
        let id = record.id;
        tables.keys.insert(key, id);
        tables.notes.insert(id, record);
        self.wrote();
        Ok(id)
    }

    async fn update_content(&self, id: RecordId, content: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let record = tables.notes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.content = content.to_vec();
        record.updated_at = unix_now();
        self.wrote();
        Ok(())
    }

    async fn upsert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let key = (room_id.to_string(), title.to_string());
        let id = match tables.keys.get(&key).copied() {
            Some(id) => {
                if let Some(record) = tables.notes.get_mut(&id) {
                    record.content = content.to_vec();
                    record.updated_at = unix_now();
                }
                id
            }
            None => {
                let record = NoteRecord::new(room_id, title, content);
                let id = record.id;
                tables.keys.insert(key, id);
                tables.notes.insert(id, record);
                id
            }
        };
        self.wrote();
        Ok(id)
    }

    async fn delete(&self, room_id: &str, title: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        match tables.keys.remove(&(room_id.to_string(), title.to_string())) {
            Some(id) => {
                tables.notes.remove(&id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
