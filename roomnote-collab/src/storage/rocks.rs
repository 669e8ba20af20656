//! RocksDB-backed note store.
//!
//! Column families:
//! - `notes`    : record id (16 bytes) → bincode [`StoredNote`], content LZ4 compressed
//! - `note_keys`: `<room_len:4 BE><room_id><title>` → record id
//!
//! Both families are written in one batch so the key index never points
//! at a missing note. Insert is check-then-write, serialized by a mutex
//! so two concurrent inserts of one key cannot both succeed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{unix_now, NoteRecord, NoteStore, RecordId, StoreError};

const CF_NOTES: &str = "notes";
const CF_NOTE_KEYS: &str = "note_keys";

const COLUMN_FAMILIES: &[&str] = &[CF_NOTES, CF_NOTE_KEYS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("roomnote_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk form of a [`NoteRecord`].
#[derive(Debug, Serialize, Deserialize)]
struct StoredNote {
    id: Uuid,
    room_id: String,
    title: String,
    /// `lz4_flex::compress_prepend_size` output
    content: Vec<u8>,
    created_at: u64,
    updated_at: u64,
}

impl StoredNote {
    fn from_record(record: &NoteRecord) -> Self {
        Self {
            id: record.id,
            room_id: record.room_id.clone(),
            title: record.title.clone(),
            content: lz4_flex::compress_prepend_size(&record.content),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn into_record(self) -> Result<NoteRecord, StoreError> {
        let content = lz4_flex::decompress_size_prepended(&self.content)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Ok(NoteRecord {
            id: self.id,
            room_id: self.room_id,
            title: self.title,
            content,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (note, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(note)
    }
}

/// RocksDB-backed [`NoteStore`].
pub struct RocksNoteStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes key-index check-and-write
    write_lock: Mutex<()>,
}

impl RocksNoteStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened note store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_NOTES => {
                // Content is already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_NOTE_KEYS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of stored notes.
    pub fn note_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_NOTE_KEYS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Length-prefixed so `("ab", "c")` and `("a", "bc")` never collide.
    fn key_bytes(room_id: &str, title: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + room_id.len() + title.len());
        key.extend_from_slice(&(room_id.len() as u32).to_be_bytes());
        key.extend_from_slice(room_id.as_bytes());
        key.extend_from_slice(title.as_bytes());
        key
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))
    }

    fn lookup_id(&self, room_id: &str, title: &str) -> Result<Option<RecordId>, StoreError> {
        let cf = self.cf(CF_NOTE_KEYS)?;
        match self.db.get_cf(&cf, Self::key_bytes(room_id, title))? {
            Some(bytes) => {
                let raw: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("Invalid record id in key index".into()))?;
                Ok(Some(Uuid::from_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn load(&self, id: RecordId) -> Result<Option<NoteRecord>, StoreError> {
        let cf = self.cf(CF_NOTES)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(StoredNote::decode(&bytes)?.into_record()?)),
            None => Ok(None),
        }
    }

    fn write_record(&self, record: &NoteRecord, index: bool) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(&self.cf(CF_NOTES)?, record.id.as_bytes(), StoredNote::from_record(record).encode()?);
        if index {
            batch.put_cf(
                &self.cf(CF_NOTE_KEYS)?,
                Self::key_bytes(&record.room_id, &record.title),
                record.id.as_bytes(),
            );
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn insert_locked(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
        let _guard = self.lock()?;
        if self.lookup_id(room_id, title)?.is_some() {
            return Err(StoreError::Conflict {
                room_id: room_id.to_string(),
                title: title.to_string(),
            });
        }
        let record = NoteRecord::new(room_id, title, content);
        self.write_record(&record, true)?;
        log::debug!("Inserted note {room_id}/{title} as {}", record.id);
        Ok(record.id)
    }

    fn update_locked(&self, id: RecordId, content: &[u8]) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let mut record = self.load(id)?.ok_or(StoreError::NotFound(id))?;
        record.content = content.to_vec();
        record.updated_at = unix_now();
        self.write_record(&record, false)
    }

    fn upsert_locked(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
        let _guard = self.lock()?;
        let existing = match self.lookup_id(room_id, title)? {
            Some(id) => self.load(id)?,
            None => None,
        };
        match existing {
            Some(mut record) => {
                record.content = content.to_vec();
                record.updated_at = unix_now();
                self.write_record(&record, false)?;
                Ok(record.id)
            }
            None => {
                let record = NoteRecord::new(room_id, title, content);
                self.write_record(&record, true)?;
                Ok(record.id)
            }
        }
    }

    fn delete_locked(&self, room_id: &str, title: &str) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        let Some(id) = self.lookup_id(room_id, title)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_NOTES)?, id.as_bytes());
        batch.delete_cf(&self.cf(CF_NOTE_KEYS)?, Self::key_bytes(room_id, title));
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(true)
    }
}

#[async_trait]
impl NoteStore for RocksNoteStore {
    async fn find_by_key(&self, room_id: &str, title: &str) -> Result<Option<NoteRecord>, StoreError> {
        match self.lookup_id(room_id, title)? {
            Some(id) => self.load(id),
            None => Ok(None),
        }
    }

    async fn insert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
        self.insert_locked(room_id, title, content)
    }

    async fn update_content(&self, id: RecordId, content: &[u8]) -> Result<(), StoreError> {
        self.update_locked(id, content)
    }

    async fn upsert(&self, room_id: &str, title: &str, content: &[u8]) -> Result<RecordId, StoreError> {
        self.upsert_locked(room_id, title, content)
    }

    async fn delete(&self, room_id: &str, title: &str) -> Result<bool, StoreError> {
        self.delete_locked(room_id, title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksNoteStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let (_dir, store) = open_temp();
        let content = b"shared note content, long enough that lz4 has something to chew on".repeat(4);

        let id = store.insert("room", "notes.md", &content).await.unwrap();
        let record = store.find_by_key("room", "notes.md").await.unwrap().unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.room_id, "room");
        assert_eq!(record.title, "notes.md");
        assert_eq!(record.content, content);
        assert!(store.find_by_key("room", "other.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_conflict() {
        let (_dir, store) = open_temp();
        store.insert("r", "x", b"a").await.unwrap();

        let err = store.insert("r", "x", b"b").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        let record = store.find_by_key("r", "x").await.unwrap().unwrap();
        assert_eq!(record.content, b"a");
    }

    #[tokio::test]
    async fn test_key_encoding_has_no_collisions() {
        let (_dir, store) = open_temp();
        store.insert("ab", "c", b"1").await.unwrap();
        store.insert("a", "bc", b"2").await.unwrap();
        assert_eq!(store.note_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_content() {
        let (_dir, store) = open_temp();
        let id = store.insert("r", "x", b"old").await.unwrap();
        store.update_content(id, b"new").await.unwrap();

        let record = store.find_by_key("r", "x").await.unwrap().unwrap();
        assert_eq!(record.content, b"new");
        assert!(matches!(
            store.update_content(Uuid::new_v4(), b"z").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let (_dir, store) = open_temp();
        let id = store.upsert("r", "x", b"1").await.unwrap();
        assert_eq!(store.upsert("r", "x", b"2").await.unwrap(), id);
        assert_eq!(store.note_count().unwrap(), 1);

        assert!(store.delete("r", "x").await.unwrap());
        assert!(!store.delete("r", "x").await.unwrap());
        assert!(store.find_by_key("r", "x").await.unwrap().is_none());
        assert_eq!(store.note_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reopen_keeps_notes() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            let id = store.insert("r", "x", b"durable").await.unwrap();
            store.sync().unwrap();
            id
        };

        let store = RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let record = store.find_by_key("r", "x").await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.content, b"durable");
    }

    #[tokio::test]
    async fn test_concurrent_inserts_one_winner() {
        let (_dir, store) = open_temp();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.insert("r", "x", &[i]).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
