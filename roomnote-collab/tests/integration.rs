//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real relay and connect real clients,
//! verifying the full pipeline from edit to peer replica to store.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use roomnote_collab::client::{ClientConfig, ClientEvent, ConnectionState, Lifecycle, SyncClient};
use roomnote_collab::protocol::{MessageType, SyncMessage};
use roomnote_collab::server::{ServerConfig, SyncServer};
use roomnote_collab::session::FileState;
use roomnote_collab::storage::{MemoryNoteStore, NoteStore};
use roomnote_core::ReplicatedDocument;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Start a relay on a free port.
async fn start_test_server() -> (SyncServer, SocketAddr) {
    let server = SyncServer::new(ServerConfig::for_testing());
    let (addr, _handle) = server.spawn().await.unwrap();
    (server, addr)
}

fn url(addr: SocketAddr) -> String {
    format!("ws://{addr}")
}

fn client(addr: SocketAddr, store: Arc<MemoryNoteStore>) -> SyncClient {
    SyncClient::new(ClientConfig::for_testing(url(addr)), store)
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = timeout(Duration::from_secs(5), async {
        while !check().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn wait_live(client: &SyncClient, room: &str, file: &str) {
    eventually("file to go live", || async {
        client.file_state(room, file).await == Some(FileState::Live)
    })
    .await;
}

async fn wait_content(client: &SyncClient, room: &str, file: &str, expected: &str) {
    eventually(&format!("content {expected:?}"), || async {
        client.content(room, file).await.is_ok_and(|c| c == expected)
    })
    .await;
}

/// A bare protocol peer for observing relay traffic.
struct RawPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(url(addr)).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, msg: SyncMessage) {
        let bytes = msg.encode().unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Next protocol message, or `None` if nothing arrives within `wait`.
    async fn recv(&mut self, wait: Duration) -> Option<SyncMessage> {
        loop {
            match timeout(wait, self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    let bytes: Vec<u8> = data.into();
                    return Some(SyncMessage::decode(&bytes).unwrap());
                }
                Ok(Some(Ok(_))) => continue,
                _ => return None,
            }
        }
    }

    /// Collect every message of `kind` arriving within `wait`.
    async fn collect(&mut self, kind: MessageType, wait: Duration) -> Vec<SyncMessage> {
        let mut found = Vec::new();
        while let Some(msg) = self.recv(wait).await {
            if msg.msg_type == kind {
                found.push(msg);
            }
        }
        found
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, addr) = start_test_server().await;
    let result = tokio_tungstenite::connect_async(url(addr)).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_client_connects_and_reports_state() {
    let (_server, addr) = start_test_server().await;
    let client = client(addr, Arc::new(MemoryNoteStore::new()));
    let mut events = client.take_event_rx().await.unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let mut saw_connected = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if event == ClientEvent::ConnectionChanged(ConnectionState::Connected) {
            saw_connected = true;
        }
    }
    assert!(saw_connected);
}

#[tokio::test]
async fn test_ping_answered_with_pong() {
    let (_server, addr) = start_test_server().await;
    let mut peer = RawPeer::connect(addr).await;
    peer.send(SyncMessage::ping()).await;

    let reply = peer.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.msg_type, MessageType::Pong);
}

// ─── Sync ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_editor_goes_live_without_peers() {
    let (_server, addr) = start_test_server().await;
    let alice = client(addr, Arc::new(MemoryNoteStore::new()));

    let mut observer = RawPeer::connect(addr).await;
    observer.send(SyncMessage::join_file("room", "readme")).await;
    sleep(Duration::from_millis(50)).await;

    alice.open_file("room", "notes.md").await.unwrap();
    wait_live(&alice, "room", "notes.md").await;
    assert_eq!(alice.content("room", "notes.md").await.unwrap(), "");

    // Joining a file nobody else edits is not a departure.
    let finals = observer.collect(MessageType::SaveFinal, Duration::from_millis(300)).await;
    assert!(finals.is_empty());
}

#[tokio::test]
async fn test_late_joiner_receives_live_peer_state() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());
    let bob = client(addr, store.clone());

    alice.open_file("room", "notes.md").await.unwrap();
    wait_live(&alice, "room", "notes.md").await;
    alice.edit("room", "notes.md", 0, 0, "hello from alice").await.unwrap();

    bob.open_file("room", "notes.md").await.unwrap();
    wait_live(&bob, "room", "notes.md").await;
    wait_content(&bob, "room", "notes.md", "hello from alice").await;
}

#[tokio::test]
async fn test_live_edits_reach_peer() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());
    let bob = client(addr, store.clone());

    alice.open_file("room", "x").await.unwrap();
    wait_live(&alice, "room", "x").await;
    bob.open_file("room", "x").await.unwrap();
    wait_live(&bob, "room", "x").await;

    alice.edit("room", "x", 0, 0, "abc").await.unwrap();
    wait_content(&bob, "room", "x", "abc").await;

    bob.edit("room", "x", 3, 0, "def").await.unwrap();
    wait_content(&alice, "room", "x", "abcdef").await;
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());
    let bob = client(addr, store.clone());

    alice.open_file("room", "x").await.unwrap();
    wait_live(&alice, "room", "x").await;
    bob.open_file("room", "x").await.unwrap();
    wait_live(&bob, "room", "x").await;

    let (a, b) = tokio::join!(
        alice.edit("room", "x", 0, 0, "AAA"),
        bob.edit("room", "x", 0, 0, "BBB"),
    );
    a.unwrap();
    b.unwrap();

    eventually("replicas to converge", || async {
        let left = alice.content("room", "x").await.unwrap();
        let right = bob.content("room", "x").await.unwrap();
        left == right && left.len() == 6
    })
    .await;
    let merged = alice.content("room", "x").await.unwrap();
    assert!(merged.contains("AAA") && merged.contains("BBB"));
}

#[tokio::test]
async fn test_small_outbound_queues_still_converge() {
    let server = SyncServer::new(ServerConfig {
        outbound_capacity: 2,
        send_timeout: Duration::from_millis(20),
        ..ServerConfig::for_testing()
    });
    let (addr, _relay) = server.spawn().await.unwrap();
    let store = Arc::new(MemoryNoteStore::new());
    let config = ClientConfig {
        broadcast_debounce: Duration::ZERO,
        max_reconnect_attempts: 20,
        ..ClientConfig::for_testing(url(addr))
    };
    let alice = SyncClient::new(config.clone(), store.clone());
    let bob = SyncClient::new(config, store.clone());

    alice.open_file("room", "x").await.unwrap();
    wait_live(&alice, "room", "x").await;
    bob.open_file("room", "x").await.unwrap();
    wait_live(&bob, "room", "x").await;

    let burst = |client: SyncClient, letter: &'static str| async move {
        for _ in 0..40 {
            client.edit("room", "x", 0, 0, letter).await.unwrap();
        }
    };
    tokio::join!(burst(alice.clone(), "a"), burst(bob.clone(), "b"));

    eventually("replicas to converge", || async {
        let left = alice.content("room", "x").await.unwrap();
        let right = bob.content("room", "x").await.unwrap();
        left == right && left.len() == 80
    })
    .await;
}

#[tokio::test]
async fn test_remote_edits_are_tagged_remote() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());
    let bob = client(addr, store.clone());
    let mut bob_events = bob.take_event_rx().await.unwrap();

    alice.open_file("room", "x").await.unwrap();
    wait_live(&alice, "room", "x").await;
    bob.open_file("room", "x").await.unwrap();
    wait_live(&bob, "room", "x").await;

    alice.edit("room", "x", 0, 0, "ping").await.unwrap();
    wait_content(&bob, "room", "x", "ping").await;

    let mut origins = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), bob_events.recv()).await {
        if let ClientEvent::DocumentChanged { origin, .. } = event {
            origins.push(origin);
        }
    }
    assert!(!origins.is_empty());
    assert!(origins.iter().all(|o| *o == roomnote_core::Origin::Remote));
}

#[tokio::test]
async fn test_routing_isolated_by_room_and_file() {
    let (_server, addr) = start_test_server().await;
    let alice = client(addr, Arc::new(MemoryNoteStore::new()));

    let mut same_room_other_file = RawPeer::connect(addr).await;
    same_room_other_file.send(SyncMessage::join_file("room", "other")).await;
    let mut other_room = RawPeer::connect(addr).await;
    other_room.send(SyncMessage::join_file("elsewhere", "x")).await;
    let mut same_file = RawPeer::connect(addr).await;
    same_file.send(SyncMessage::join_file("room", "x")).await;
    sleep(Duration::from_millis(50)).await;

    alice.open_file("room", "x").await.unwrap();
    alice.edit("room", "x", 0, 0, "secret").await.unwrap();

    let updates = same_file.collect(MessageType::Update, Duration::from_millis(300)).await;
    assert!(!updates.is_empty());
    assert!(updates.iter().all(|m| m.room_id == "room" && m.file_name == "x"));

    let leaked = same_room_other_file.collect(MessageType::Update, Duration::from_millis(200)).await;
    assert!(leaked.is_empty());
    let leaked = other_room.collect(MessageType::Update, Duration::from_millis(200)).await;
    assert!(leaked.is_empty());
}

#[tokio::test]
async fn test_offline_edits_pushed_after_reconnect() {
    let port = {
        let spare = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    };
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let store = Arc::new(MemoryNoteStore::new());

    let config = ClientConfig {
        max_reconnect_attempts: 10,
        reconnect_delay: Duration::from_millis(100),
        ..ClientConfig::for_testing(url(addr))
    };
    let alice = SyncClient::new(config, store.clone());
    alice.open_file("room", "x").await.unwrap();
    assert_eq!(alice.file_state("room", "x").await, Some(FileState::Disconnected));
    alice.edit("room", "x", 0, 0, "written offline").await.unwrap();

    let server = SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..ServerConfig::for_testing()
    });
    let _relay = server.spawn().await.unwrap();

    wait_live(&alice, "room", "x").await;

    let bob = client(addr, store.clone());
    bob.open_file("room", "x").await.unwrap();
    wait_content(&bob, "room", "x", "written offline").await;
}

// ─── Relay bookkeeping ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_status_tracks_editors() {
    let (server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());
    let bob = client(addr, store.clone());

    alice.open_file("room", "x").await.unwrap();
    bob.open_file("room", "x").await.unwrap();
    eventually("two editors", || async { server.status().await.editors("room", "x") == 2 }).await;

    let seen_by_client = alice.relay_status().await.unwrap();
    assert_eq!(seen_by_client.editors("room", "x"), 2);
    assert_eq!(seen_by_client.active_rooms, 1);

    alice.close_file("room", "x").await.unwrap();
    eventually("one editor", || async { server.status().await.editors("room", "x") == 1 }).await;

    bob.close_file("room", "x").await.unwrap();
    eventually("no editors", || async { server.status().await.editors("room", "x") == 0 }).await;
}

#[tokio::test]
async fn test_final_save_emitted_once_when_last_editor_leaves() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());
    let bob = client(addr, store.clone());

    let mut observer = RawPeer::connect(addr).await;
    observer.send(SyncMessage::join_file("room", "readme")).await;

    alice.open_file("room", "x").await.unwrap();
    bob.open_file("room", "x").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    alice.close_file("room", "x").await.unwrap();
    let early = observer.collect(MessageType::SaveFinal, Duration::from_millis(200)).await;
    assert!(early.is_empty(), "file still has an editor");

    bob.close_file("room", "x").await.unwrap();
    let finals = observer.collect(MessageType::SaveFinal, Duration::from_millis(300)).await;
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].file_name, "x");
}

// ─── Saves ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_file_saves_latest_content() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());

    alice.open_file("room", "x").await.unwrap();
    wait_live(&alice, "room", "x").await;
    alice.edit("room", "x", 0, 0, "draft").await.unwrap();
    alice.edit("room", "x", 5, 0, " final").await.unwrap();
    alice.close_file("room", "x").await.unwrap();

    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    let doc = ReplicatedDocument::from_state(&record.content).unwrap();
    assert_eq!(doc.content(), "draft final");
}

#[tokio::test]
async fn test_late_joiner_loads_from_store() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let seed = ReplicatedDocument::new();
    seed.apply_local_edit(0, 0, "persisted yesterday").unwrap();
    store.insert("room", "x", &seed.encode_full_state()).await.unwrap();

    let alice = client(addr, store.clone());
    alice.open_file("room", "x").await.unwrap();
    wait_live(&alice, "room", "x").await;
    assert_eq!(alice.content("room", "x").await.unwrap(), "persisted yesterday");

    // Loaded text is the baseline, so closing writes nothing.
    alice.close_file("room", "x").await.unwrap();
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn test_two_editors_saving_share_one_record() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());
    let bob = client(addr, store.clone());

    alice.open_file("room", "x").await.unwrap();
    wait_live(&alice, "room", "x").await;
    bob.open_file("room", "x").await.unwrap();
    wait_live(&bob, "room", "x").await;

    alice.edit("room", "x", 0, 0, "shared").await.unwrap();
    wait_content(&bob, "room", "x", "shared").await;

    let (a, b) = tokio::join!(alice.request_save("room", "x"), bob.request_save("room", "x"));
    a.unwrap();
    b.unwrap();

    assert_eq!(store.len().await, 1);
    let record = store.find_by_key("room", "x").await.unwrap().unwrap();
    let doc = ReplicatedDocument::from_state(&record.content).unwrap();
    assert_eq!(doc.content(), "shared");
}

#[tokio::test]
async fn test_lifecycle_hidden_saves_all_open_files() {
    let (_server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());

    for file in ["a", "b"] {
        alice.open_file("room", file).await.unwrap();
        wait_live(&alice, "room", file).await;
        alice.edit("room", file, 0, 0, file).await.unwrap();
    }

    alice.lifecycle(Lifecycle::Hidden).await.unwrap();
    assert_eq!(store.len().await, 2);

    // Nothing changed since, so unload writes nothing new.
    let writes = store.write_count();
    alice.lifecycle(Lifecycle::BeforeUnload).await.unwrap();
    assert_eq!(store.write_count(), writes);
}

#[tokio::test]
async fn test_shutdown_leaves_relay_clean() {
    let (server, addr) = start_test_server().await;
    let store = Arc::new(MemoryNoteStore::new());
    let alice = client(addr, store.clone());

    alice.open_file("room", "x").await.unwrap();
    alice.edit("room", "x", 0, 0, "bye").await.unwrap();
    eventually("editor registered", || async { server.status().await.editors("room", "x") == 1 }).await;

    alice.shutdown().await.unwrap();
    eventually("editor gone", || async { server.status().await.editors("room", "x") == 0 }).await;
    assert_eq!(store.len().await, 1);
}
