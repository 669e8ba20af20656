//! Persistence integration tests.
//!
//! Verifies:
//! - Notes saved by the client survive a store restart
//! - Reopened notes come back from RocksDB when no peer is online
//! - Concurrent first saves collapse into one record
//! - A store outage does not lose edits
//! - Typing before the first sync never replaces the stored note

use std::sync::Arc;

use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};

use roomnote_collab::client::{ClientConfig, ClientEvent, SyncClient};
use roomnote_collab::server::{ServerConfig, SyncServer};
use roomnote_collab::session::FileState;
use roomnote_collab::storage::{
    save_note, MemoryNoteStore, NoteStore, RecordCache, RocksNoteStore, SaveOutcome, StoreConfig,
};
use roomnote_core::ReplicatedDocument;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn note_state(text: &str) -> Vec<u8> {
    let doc = ReplicatedDocument::new();
    doc.apply_local_edit(0, 0, text).unwrap();
    doc.encode_full_state()
}

fn stored_text(content: &[u8]) -> String {
    ReplicatedDocument::from_state(content).unwrap().content()
}

async fn wait_live(client: &SyncClient, room: &str, file: &str) {
    let live = timeout(Duration::from_secs(5), async {
        while client.file_state(room, file).await != Some(FileState::Live) {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(live.is_ok(), "{room}/{file} never went live");
}

// ─── Store level ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_saved_note_survives_restart() {
    let dir = tempdir().unwrap();
    let first_id = {
        let store = RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let cache = RecordCache::new();
        let outcome = save_note(&store, &cache, "room", "x", &note_state("v1")).await.unwrap();
        assert!(matches!(outcome, SaveOutcome::Inserted(_)));
        store.sync().unwrap();
        outcome.record_id()
    };

    let store = RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    assert_eq!(record.id, first_id);
    assert_eq!(stored_text(&record.content), "v1");

    // A fresh cache still updates the same record.
    let cache = RecordCache::new();
    let outcome = save_note(&store, &cache, "room", "x", &note_state("v2")).await.unwrap();
    assert_eq!(outcome, SaveOutcome::Updated(first_id));
    assert_eq!(store.note_count().unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_first_saves_share_one_record() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let cache = RecordCache::new();
            save_note(store.as_ref(), &cache, "room", "x", &note_state(&format!("writer {i}")))
                .await
                .unwrap()
                .record_id()
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.note_count().unwrap(), 1);
}

#[tokio::test]
async fn test_large_note_round_trips_compressed() {
    let dir = tempdir().unwrap();
    let store = RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let text = "The quick brown fox jumps over the lazy dog. ".repeat(4_000);

    let id = store.insert("room", "big", &note_state(&text)).await.unwrap();
    let record = store.find_by_key("room", "big").await.unwrap().unwrap();
    assert_eq!(record.id, id);
    assert_eq!(stored_text(&record.content), text);
}

// ─── Through the client ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_close_writes_to_rocksdb() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let server = SyncServer::new(ServerConfig::for_testing());
    let (addr, _relay) = server.spawn().await.unwrap();

    let client = SyncClient::new(ClientConfig::for_testing(format!("ws://{addr}")), store.clone());
    client.open_file("room", "minutes").await.unwrap();
    wait_live(&client, "room", "minutes").await;
    client.edit("room", "minutes", 0, 0, "Agenda: ship it").await.unwrap();
    client.close_file("room", "minutes").await.unwrap();

    let record = store.find_by_key("room", "minutes").await.unwrap().unwrap();
    assert_eq!(stored_text(&record.content), "Agenda: ship it");
}

#[tokio::test]
async fn test_reopened_note_loads_from_rocksdb() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksNoteStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let server = SyncServer::new(ServerConfig::for_testing());
    let (addr, _relay) = server.spawn().await.unwrap();
    let url = format!("ws://{addr}");

    let first = SyncClient::new(ClientConfig::for_testing(url.clone()), store.clone());
    first.open_file("room", "x").await.unwrap();
    wait_live(&first, "room", "x").await;
    first.edit("room", "x", 0, 0, "remember me").await.unwrap();
    first.shutdown().await.unwrap();

    let second = SyncClient::new(ClientConfig::for_testing(url), store.clone());
    second.open_file("room", "x").await.unwrap();
    wait_live(&second, "room", "x").await;
    assert_eq!(second.content("room", "x").await.unwrap(), "remember me");

    // Further edits extend the same record.
    second.edit("room", "x", 11, 0, "!").await.unwrap();
    second.close_file("room", "x").await.unwrap();
    assert_eq!(store.note_count().unwrap(), 1);
    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    assert_eq!(stored_text(&record.content), "remember me!");
}

#[tokio::test]
async fn test_store_outage_keeps_edits_until_recovery() {
    let store = Arc::new(MemoryNoteStore::new());
    let server = SyncServer::new(ServerConfig::for_testing());
    let (addr, _relay) = server.spawn().await.unwrap();

    let client = SyncClient::new(ClientConfig::for_testing(format!("ws://{addr}")), store.clone());
    let mut events = client.take_event_rx().await.unwrap();
    client.open_file("room", "x").await.unwrap();
    wait_live(&client, "room", "x").await;

    store.set_unavailable(true);
    client.edit("room", "x", 0, 0, "during outage").await.unwrap();

    let failed = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if matches!(event, ClientEvent::SaveFailed { .. }) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(failed);
    assert_eq!(client.content("room", "x").await.unwrap(), "during outage");

    store.set_unavailable(false);
    client.close_file("room", "x").await.unwrap();
    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    assert_eq!(stored_text(&record.content), "during outage");
}

#[tokio::test]
async fn test_typing_before_sync_keeps_stored_note() {
    let store = Arc::new(MemoryNoteStore::new());
    store.insert("room", "x", &note_state("stored")).await.unwrap();
    let server = SyncServer::new(ServerConfig::for_testing());
    let (addr, _relay) = server.spawn().await.unwrap();

    let config = ClientConfig {
        sync_timeout: Duration::from_millis(400),
        save_debounce: Duration::from_millis(20),
        ..ClientConfig::for_testing(format!("ws://{addr}"))
    };
    let client = SyncClient::new(config, store.clone());
    client.open_file("room", "x").await.unwrap();
    client.edit("room", "x", 0, 0, "typed ").await.unwrap();

    // Debounced saves fire well before the sync timeout.
    sleep(Duration::from_millis(150)).await;
    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    assert!(stored_text(&record.content).contains("stored"));

    wait_live(&client, "room", "x").await;
    let content = client.content("room", "x").await.unwrap();
    assert!(content.contains("stored") && content.contains("typed "));

    client.close_file("room", "x").await.unwrap();
    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    assert_eq!(stored_text(&record.content), content);
}

#[tokio::test]
async fn test_close_before_sync_merges_stored_note() {
    let store = Arc::new(MemoryNoteStore::new());
    store.insert("room", "x", &note_state("stored")).await.unwrap();
    let server = SyncServer::new(ServerConfig::for_testing());
    let (addr, _relay) = server.spawn().await.unwrap();

    let config = ClientConfig {
        sync_timeout: Duration::from_secs(5),
        ..ClientConfig::for_testing(format!("ws://{addr}"))
    };
    let client = SyncClient::new(config, store.clone());
    client.open_file("room", "x").await.unwrap();
    client.edit("room", "x", 0, 0, "quick ").await.unwrap();
    client.close_file("room", "x").await.unwrap();

    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    let text = stored_text(&record.content);
    assert!(text.contains("stored") && text.contains("quick "), "got {text:?}");
    assert_eq!(store.len().await, 1);
}
