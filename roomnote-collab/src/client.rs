//! WebSocket sync client for room notes.
//!
//! Provides:
//! - One shared relay connection with bounded reconnect
//! - Per-file sessions (join, catch-up, live editing)
//! - Debounced broadcast of local edits
//! - Debounced and forced saves through a [`NoteStore`]
//!
//! [`SyncClient`] is a cheap handle. Every open file, timer and socket is
//! owned by one background task that receives [`Command`]s, so a document
//! is never touched from two places at once. Timers, socket reads and
//! finished saves come back to that task as commands too.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use roomnote_core::{DocumentError, Origin, ReplicatedDocument};

use crate::protocol::{MessageType, ProtocolError, RelayStatus, SyncMessage};
use crate::scheduler::{ScheduledTask, TaskId, TaskSlot};
use crate::session::{FileKey, FileSession, FileState, SaveDecision, SaveJob};
use crate::storage::{save_note, NoteRecord, NoteStore, RecordCache, RecordId, SaveOutcome, StoreError};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Delay between the first unsent local edit and its broadcast
    pub broadcast_debounce: Duration,
    /// Delay between the first unsaved change and its save
    pub save_debounce: Duration,
    /// How long a joining file waits for peer state before asking the store
    pub sync_timeout: Duration,
    /// Timeout for opening the socket and for status queries
    pub connect_timeout: Duration,
    /// Reconnect attempts after a lost connection
    pub max_reconnect_attempts: u32,
    /// Base reconnect delay; attempt `n` waits `n × reconnect_delay`
    pub reconnect_delay: Duration,
    /// Buffered events before new ones are dropped
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            broadcast_debounce: Duration::from_millis(50),
            save_debounce: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Short timers for tests against a local relay.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            broadcast_debounce: Duration::from_millis(10),
            save_debounce: Duration::from_millis(100),
            sync_timeout: Duration::from_millis(150),
            connect_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(50),
            event_capacity: 1024,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Page visibility signals from the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// The note went to the background
    Hidden,
    /// The host is about to unload
    BeforeUnload,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    FileStateChanged {
        room_id: String,
        file_name: String,
        state: FileState,
    },
    DocumentChanged {
        room_id: String,
        file_name: String,
        origin: Origin,
    },
    Saved {
        room_id: String,
        file_name: String,
        record_id: RecordId,
    },
    SaveSkipped {
        room_id: String,
        file_name: String,
    },
    SaveFailed {
        room_id: String,
        file_name: String,
        error: String,
    },
    MergeFailed {
        room_id: String,
        file_name: String,
        error: String,
    },
    /// The relay reported that the last editor of an open file left
    FinalSaveRequested {
        room_id: String,
        file_name: String,
    },
}

/// Client errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("File not open: {room_id}/{file_name}")]
    FileNotOpen { room_id: String, file_name: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Sync client has stopped")]
    Stopped,
}

impl ClientError {
    fn not_open(key: &FileKey) -> Self {
        ClientError::FileNotOpen {
            room_id: key.0.clone(),
            file_name: key.1.clone(),
        }
    }
}

type Reply<T> = oneshot::Sender<T>;
type SaveWaiter = oneshot::Receiver<Result<(), ClientError>>;

/// Messages to the client task.
enum Command {
    Connect {
        reply: Reply<Result<(), ClientError>>,
    },
    OpenFile {
        key: FileKey,
        reply: Reply<Result<(), ClientError>>,
    },
    Edit {
        key: FileKey,
        position: usize,
        deleted: usize,
        inserted: String,
        reply: Reply<Result<(), ClientError>>,
    },
    Content {
        key: FileKey,
        reply: Reply<Option<String>>,
    },
    FileState {
        key: FileKey,
        reply: Reply<Option<FileState>>,
    },
    Save {
        key: FileKey,
        reply: Reply<Result<SaveWaiter, ClientError>>,
    },
    Lifecycle {
        kind: Lifecycle,
        reply: Reply<Vec<SaveWaiter>>,
    },
    CloseFile {
        key: FileKey,
        reply: Reply<Result<SaveWaiter, ClientError>>,
    },
    Status {
        reply: Reply<Result<RelayStatus, ClientError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    Incoming {
        generation: u64,
        msg: SyncMessage,
    },
    Connected {
        generation: u64,
        result: Result<Transport, ClientError>,
    },
    TransportClosed {
        generation: u64,
    },
    BroadcastDue {
        key: FileKey,
        task: TaskId,
    },
    SaveDue {
        key: FileKey,
        task: TaskId,
    },
    SyncTimeout {
        key: FileKey,
        task: TaskId,
    },
    ReconnectDue {
        task: TaskId,
    },
    PersistedLoaded {
        key: FileKey,
        session: u64,
        result: Result<Option<NoteRecord>, StoreError>,
    },
    SaveFinished {
        key: FileKey,
        session: u64,
        text: String,
        result: Result<SaveOutcome, StoreError>,
        waiter: Reply<Result<(), ClientError>>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Connect { .. } => "Connect",
            Command::OpenFile { .. } => "OpenFile",
            Command::Edit { .. } => "Edit",
            Command::Content { .. } => "Content",
            Command::FileState { .. } => "FileState",
            Command::Save { .. } => "Save",
            Command::Lifecycle { .. } => "Lifecycle",
            Command::CloseFile { .. } => "CloseFile",
            Command::Status { .. } => "Status",
            Command::Shutdown { .. } => "Shutdown",
            Command::Incoming { .. } => "Incoming",
            Command::Connected { .. } => "Connected",
            Command::TransportClosed { .. } => "TransportClosed",
            Command::BroadcastDue { .. } => "BroadcastDue",
            Command::SaveDue { .. } => "SaveDue",
            Command::SyncTimeout { .. } => "SyncTimeout",
            Command::ReconnectDue { .. } => "ReconnectDue",
            Command::PersistedLoaded { .. } => "PersistedLoaded",
            Command::SaveFinished { .. } => "SaveFinished",
        };
        f.write_str(name)
    }
}

fn file_key(room_id: &str, file_name: &str) -> FileKey {
    (room_id.to_string(), file_name.to_string())
}

fn ready(result: Result<(), ClientError>) -> SaveWaiter {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

/// Handle to the sync client task. Clones share the same client.
#[derive(Clone)]
pub struct SyncClient {
    commands: mpsc::UnboundedSender<Command>,
    connection: Arc<RwLock<ConnectionState>>,
    event_rx: Arc<Mutex<Option<mpsc::Receiver<ClientEvent>>>>,
    request_timeout: Duration,
}

impl SyncClient {
    /// Spawn the client task. Must be called inside a tokio runtime.
    ///
    /// No connection is made until [`connect`](Self::connect) or the
    /// first [`open_file`](Self::open_file).
    pub fn new(config: ClientConfig, store: Arc<dyn NoteStore>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let connection = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let request_timeout = config.connect_timeout;

        let actor = ClientActor {
            config,
            store,
            cache: Arc::new(RecordCache::new()),
            commands: cmd_tx.downgrade(),
            events: event_tx,
            connection: connection.clone(),
            sessions: HashMap::new(),
            save_locks: HashMap::new(),
            transport: None,
            generation: 0,
            connecting: false,
            connect_waiters: Vec::new(),
            reconnect_timer: TaskSlot::new(),
            reconnect_attempt: 0,
            status_waiters: VecDeque::new(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Self {
            commands: cmd_tx,
            connection,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
            request_timeout,
        }
    }

    /// Take the event receiver (only the first caller gets it).
    pub async fn take_event_rx(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.lock().await.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection.read().await
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    async fn await_save(waiter: SaveWaiter) -> Result<(), ClientError> {
        waiter.await.map_err(|_| ClientError::Stopped)?
    }

    /// Open the relay connection now instead of on first `open_file`.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Start editing a file. Succeeds offline; the file then syncs on reconnect.
    pub async fn open_file(&self, room_id: &str, file_name: &str) -> Result<(), ClientError> {
        let key = file_key(room_id, file_name);
        self.request(|reply| Command::OpenFile { key, reply }).await?
    }

    /// Replace `deleted` chars at `position` with `inserted`.
    pub async fn edit(
        &self,
        room_id: &str,
        file_name: &str,
        position: usize,
        deleted: usize,
        inserted: &str,
    ) -> Result<(), ClientError> {
        let key = file_key(room_id, file_name);
        let inserted = inserted.to_string();
        self.request(|reply| Command::Edit {
            key,
            position,
            deleted,
            inserted,
            reply,
        })
        .await?
    }

    pub async fn content(&self, room_id: &str, file_name: &str) -> Result<String, ClientError> {
        let key = file_key(room_id, file_name);
        let lookup = key.clone();
        self.request(|reply| Command::Content { key: lookup, reply })
            .await?
            .ok_or_else(|| ClientError::not_open(&key))
    }

    /// `None` if the file is not open.
    pub async fn file_state(&self, room_id: &str, file_name: &str) -> Option<FileState> {
        let key = file_key(room_id, file_name);
        self.request(|reply| Command::FileState { key, reply })
            .await
            .ok()
            .flatten()
    }

    /// Save now, without waiting for the debounce or an in-flight save.
    pub async fn request_save(&self, room_id: &str, file_name: &str) -> Result<(), ClientError> {
        let key = file_key(room_id, file_name);
        let waiter = self.request(|reply| Command::Save { key, reply }).await??;
        Self::await_save(waiter).await
    }

    /// Force-save every open file. Returns the first failure.
    pub async fn lifecycle(&self, kind: Lifecycle) -> Result<(), ClientError> {
        let waiters = self.request(|reply| Command::Lifecycle { kind, reply }).await?;
        let mut first_error = None;
        for waiter in waiters {
            if let Err(e) = Self::await_save(waiter).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Leave the file and wait for its final save.
    pub async fn close_file(&self, room_id: &str, file_name: &str) -> Result<(), ClientError> {
        let key = file_key(room_id, file_name);
        let waiter = self.request(|reply| Command::CloseFile { key, reply }).await??;
        Self::await_save(waiter).await
    }

    /// Ask the relay for its diagnostic status.
    pub async fn relay_status(&self) -> Result<RelayStatus, ClientError> {
        let pending = self.request(|reply| Command::Status { reply });
        match tokio::time::timeout(self.request_timeout, pending).await {
            Ok(result) => result?,
            Err(_) => Err(ProtocolError::Timeout.into()),
        }
    }

    /// Save and close every file, drop the connection and stop the task.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Live relay connection.
struct Transport {
    generation: u64,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Transport {
    async fn open(
        url: &str,
        timeout: Duration,
        generation: u64,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| ClientError::Protocol(ProtocolError::Timeout))?
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode frames and hand them to the client task
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(msg) => {
                                let Some(tx) = commands.upgrade() else {
                                    return;
                                };
                                if tx.send(Command::Incoming { generation, msg }).is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode relay frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("Relay connection error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::TransportClosed { generation });
            }
        });

        Ok(Self {
            generation,
            out_tx,
            reader,
        })
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ClientError> {
        let bytes = msg.encode()?;
        self.out_tx
            .send(bytes)
            .map_err(|_| ClientError::Transport("connection closed".into()))
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Dropping `out_tx` lets the writer close the socket.
        self.reader.abort();
    }
}

/// State owned by the client task.
struct ClientActor {
    config: ClientConfig,
    store: Arc<dyn NoteStore>,
    cache: Arc<RecordCache>,
    /// Weak so that dropping every handle ends the task
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::Sender<ClientEvent>,
    connection: Arc<RwLock<ConnectionState>>,
    sessions: HashMap<FileKey, FileSession>,
    /// Orders store writes per file, including writes of closed sessions
    save_locks: HashMap<FileKey, Arc<Mutex<()>>>,
    transport: Option<Transport>,
    /// Bumped per connect attempt; results and frames of older attempts are ignored
    generation: u64,
    connecting: bool,
    connect_waiters: Vec<Reply<Result<(), ClientError>>>,
    reconnect_timer: TaskSlot,
    reconnect_attempt: u32,
    status_waiters: VecDeque<Reply<Result<RelayStatus, ClientError>>>,
}

impl ClientActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = commands.recv().await {
            log::trace!("Client command {cmd:?}");
            if let Command::Shutdown { reply } = cmd {
                self.shutdown().await;
                let _ = reply.send(());
                return;
            }
            self.handle(cmd).await;
        }
        // Every handle dropped without an explicit shutdown.
        self.shutdown().await;
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                if self.transport.is_some() {
                    let _ = reply.send(Ok(()));
                    return;
                }
                self.reconnect_attempt = 0;
                self.connect_waiters.push(reply);
                self.start_connect().await;
            }
            Command::OpenFile { key, reply } => {
                let _ = reply.send(self.open_file(key).await);
            }
            Command::Connected { generation, result } => {
                self.on_connected(generation, result).await;
            }
            Command::Edit {
                key,
                position,
                deleted,
                inserted,
                reply,
            } => {
                let _ = reply.send(self.edit(&key, position, deleted, &inserted));
            }
            Command::Content { key, reply } => {
                let _ = reply.send(self.sessions.get(&key).map(FileSession::content));
            }
            Command::FileState { key, reply } => {
                let _ = reply.send(self.sessions.get(&key).map(FileSession::state));
            }
            Command::Save { key, reply } => {
                let result = match self.start_save(&key, true) {
                    Some(waiter) => Ok(waiter),
                    None => Err(ClientError::not_open(&key)),
                };
                let _ = reply.send(result);
            }
            Command::Lifecycle { kind, reply } => {
                log::debug!("Lifecycle {kind:?}: saving {} open files", self.sessions.len());
                let keys: Vec<FileKey> = self.sessions.keys().cloned().collect();
                let waiters = keys
                    .iter()
                    .filter_map(|key| self.start_save(key, true))
                    .collect();
                let _ = reply.send(waiters);
            }
            Command::CloseFile { key, reply } => {
                let _ = reply.send(self.close_file(&key));
            }
            Command::Status { reply } => match &self.transport {
                Some(transport) => match transport.send(&SyncMessage::status_request()) {
                    Ok(()) => self.status_waiters.push_back(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                None => {
                    let _ = reply.send(Err(ClientError::Transport("not connected".into())));
                }
            },
            Command::Shutdown { reply } => {
                // Handled in `run`.
                let _ = reply.send(());
            }
            Command::Incoming { generation, msg } => {
                if generation == self.generation {
                    self.on_incoming(msg);
                }
            }
            Command::TransportClosed { generation } => {
                self.on_transport_closed(generation).await;
            }
            Command::BroadcastDue { key, task } => self.on_broadcast_due(&key, task),
            Command::SaveDue { key, task } => {
                let fired = self
                    .sessions
                    .get_mut(&key)
                    .is_some_and(|s| s.save_timer.fired(task));
                if fired {
                    self.start_save(&key, false);
                }
            }
            Command::SyncTimeout { key, task } => self.on_sync_timeout(&key, task),
            Command::ReconnectDue { task } => {
                if self.reconnect_timer.fired(task) {
                    self.on_reconnect_due().await;
                }
            }
            Command::PersistedLoaded { key, session, result } => {
                self.on_persisted_loaded(&key, session, result);
            }
            Command::SaveFinished {
                key,
                session,
                text,
                result,
                waiter,
            } => self.on_save_finished(&key, session, text, result, waiter),
        }
    }

    // ─── Events & timers ──────────────────────────────────────────────

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::trace!("Client event dropped: {e}");
        }
    }

    fn emit_file_state(&self, key: &FileKey, state: FileState) {
        self.emit(ClientEvent::FileStateChanged {
            room_id: key.0.clone(),
            file_name: key.1.clone(),
            state,
        });
    }

    fn set_file_state(&mut self, key: &FileKey, state: FileState) {
        let changed = self
            .sessions
            .get_mut(key)
            .is_some_and(|session| session.set_state(state));
        if changed {
            self.emit_file_state(key, state);
        }
    }

    async fn set_connection(&self, state: ConnectionState) {
        let mut current = self.connection.write().await;
        if *current != state {
            *current = state;
            drop(current);
            log::debug!("Connection state: {state:?}");
            self.emit(ClientEvent::ConnectionChanged(state));
        }
    }

    /// Schedule `make(task_id)` to be delivered back to this task after `delay`.
    fn timer<F>(&self, delay: Duration, make: F) -> ScheduledTask
    where
        F: FnOnce(TaskId) -> Command + Send + 'static,
    {
        let commands = self.commands.clone();
        ScheduledTask::after(delay, move |task| async move {
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(make(task));
            }
        })
    }

    fn send(&self, msg: &SyncMessage) -> bool {
        match &self.transport {
            Some(transport) => match transport.send(msg) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Send of {:?} failed: {e}", msg.msg_type);
                    false
                }
            },
            None => false,
        }
    }

    // ─── Connection ───────────────────────────────────────────────────

    /// Open the socket in the background; the result comes back as
    /// [`Command::Connected`], so a slow handshake never blocks the task.
    async fn start_connect(&mut self) {
        if self.transport.is_some() || self.connecting {
            return;
        }
        self.connecting = true;
        self.generation += 1;
        self.set_connection(ConnectionState::Connecting).await;

        let url = self.config.server_url.clone();
        let timeout = self.config.connect_timeout;
        let generation = self.generation;
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = Transport::open(&url, timeout, generation, commands.clone()).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Connected { generation, result });
            }
        });
    }

    async fn on_connected(&mut self, generation: u64, result: Result<Transport, ClientError>) {
        if !self.connecting || generation != self.generation {
            log::debug!("Dropping stale connect result (generation {generation})");
            return;
        }
        self.connecting = false;

        match result {
            Ok(transport) => {
                log::info!("Connected to relay {}", self.config.server_url);
                self.transport = Some(transport);
                self.reconnect_attempt = 0;
                self.reconnect_timer.cancel();
                self.set_connection(ConnectionState::Connected).await;

                let keys: Vec<FileKey> = self
                    .sessions
                    .iter()
                    .filter(|(_, s)| s.state() == FileState::Disconnected)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    self.join(&key);
                }
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.config.server_url);
                self.set_connection(ConnectionState::Disconnected).await;

                // Offline: show what the store has and keep retrying the relay.
                let keys: Vec<FileKey> = self.sessions.keys().cloned().collect();
                for key in &keys {
                    self.load_persisted(key);
                }
                if !self.sessions.is_empty() && self.reconnect_timer.current_id().is_none() {
                    self.schedule_reconnect().await;
                }
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    /// Connecting → AwaitingSync for one file.
    fn join(&mut self, key: &FileKey) {
        self.set_file_state(key, FileState::Connecting);

        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        let mut outgoing = vec![
            SyncMessage::join_file(&key.0, &key.1),
            SyncMessage::request_file_sync(&key.0, &key.1),
        ];
        // Offline edits (or a store load) reach peers as one full-state update.
        if !session.document().is_empty() {
            session.clear_broadcast();
            outgoing.push(SyncMessage::update(&key.0, &key.1, session.full_state()));
        }

        for msg in &outgoing {
            self.send(msg);
        }
        self.set_file_state(key, FileState::AwaitingSync);
        self.arm_sync_timer(key);
    }

    fn arm_sync_timer(&mut self, key: &FileKey) {
        let timer_key = key.clone();
        let task = self.timer(self.config.sync_timeout, move |task| Command::SyncTimeout { key: timer_key, task });
        if let Some(session) = self.sessions.get_mut(key) {
            session.sync_timer.replace(task);
        }
    }

    async fn on_transport_closed(&mut self, generation: u64) {
        let current = self.transport.as_ref().is_some_and(|t| t.generation == generation);
        if !current {
            return;
        }
        log::warn!("Lost connection to relay {}", self.config.server_url);
        self.transport = None;

        for waiter in self.status_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Transport("connection lost".into())));
        }

        let keys: Vec<FileKey> = self.sessions.keys().cloned().collect();
        for key in &keys {
            if let Some(session) = self.sessions.get_mut(key) {
                session.sync_timer.cancel();
            }
            self.set_file_state(key, FileState::Disconnected);
        }

        self.set_connection(ConnectionState::Disconnected).await;
        if !self.sessions.is_empty() {
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(&mut self) {
        if self.reconnect_attempt >= self.config.max_reconnect_attempts {
            log::error!(
                "Giving up on relay {} after {} attempts",
                self.config.server_url,
                self.reconnect_attempt
            );
            self.set_connection(ConnectionState::Disconnected).await;
            return;
        }
        self.reconnect_attempt += 1;
        let delay = self.config.reconnect_delay * self.reconnect_attempt;
        log::info!("Reconnect attempt {} in {delay:?}", self.reconnect_attempt);

        self.set_connection(ConnectionState::Reconnecting).await;
        let task = self.timer(delay, |task| Command::ReconnectDue { task });
        self.reconnect_timer.replace(task);
    }

    async fn on_reconnect_due(&mut self) {
        if self.sessions.is_empty() || self.transport.is_some() {
            return;
        }
        self.start_connect().await;
    }

    // ─── Files ────────────────────────────────────────────────────────

    async fn open_file(&mut self, key: FileKey) -> Result<(), ClientError> {
        if self.sessions.contains_key(&key) {
            return Ok(());
        }
        log::info!("Opening {}/{}", key.0, key.1);
        self.sessions.insert(key.clone(), FileSession::new(&key.0, &key.1));

        if self.transport.is_some() {
            self.join(&key);
        } else {
            self.start_connect().await;
        }
        Ok(())
    }

    fn edit(&mut self, key: &FileKey, position: usize, deleted: usize, inserted: &str) -> Result<(), ClientError> {
        let session = self.sessions.get_mut(key).ok_or_else(|| ClientError::not_open(key))?;
        if session.apply_local_edit(position, deleted, inserted)?.is_none() {
            return Ok(());
        }
        let arm = session.broadcast_timer.current_id().is_none();

        if arm {
            let timer_key = key.clone();
            let task = self.timer(self.config.broadcast_debounce, move |task| Command::BroadcastDue {
                key: timer_key,
                task,
            });
            if let Some(session) = self.sessions.get_mut(key) {
                session.broadcast_timer.replace(task);
            }
        }

        self.emit(ClientEvent::DocumentChanged {
            room_id: key.0.clone(),
            file_name: key.1.clone(),
            origin: Origin::Local,
        });
        self.schedule_save(key);
        Ok(())
    }

    fn close_file(&mut self, key: &FileKey) -> Result<SaveWaiter, ClientError> {
        let mut session = self.sessions.remove(key).ok_or_else(|| ClientError::not_open(key))?;
        log::info!("Closing {}/{}", key.0, key.1);
        session.cancel_timers();

        if self.transport.is_some() && session.state() != FileState::Disconnected {
            match session.take_broadcast_diff() {
                Ok(Some(diff)) => {
                    self.send(&SyncMessage::update(&key.0, &key.1, diff));
                }
                Ok(None) => {}
                Err(e) => log::warn!("Dropping unsent edits of {}/{}: {e}", key.0, key.1),
            }
            self.send(&SyncMessage::leave_file(&key.0, &key.1));
        }

        Ok(self.begin_save(key, &mut session, true).unwrap_or_else(|| ready(Ok(()))))
    }

    fn on_broadcast_due(&mut self, key: &FileKey, task: TaskId) {
        let connected = self.transport.is_some();
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if !session.broadcast_timer.fired(task) {
            return;
        }
        // Without a joined connection the window stays open; the
        // full-state push on join covers it.
        if !connected || matches!(session.state(), FileState::Disconnected | FileState::Connecting) {
            return;
        }
        match session.take_broadcast_diff() {
            Ok(Some(diff)) => {
                self.send(&SyncMessage::update(&key.0, &key.1, diff));
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to encode edits of {}/{}: {e}", key.0, key.1),
        }
    }

    fn on_sync_timeout(&mut self, key: &FileKey, task: TaskId) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if !session.sync_timer.fired(task) || session.state() != FileState::AwaitingSync {
            return;
        }
        log::debug!("No peer state for {}/{} within {:?}", key.0, key.1, self.config.sync_timeout);
        if session.is_synced() {
            self.set_file_state(key, FileState::Live);
        } else {
            // Live only once the stored note is merged; the load finishes the transition.
            self.load_persisted(key);
        }
    }

    fn on_incoming(&mut self, msg: SyncMessage) {
        let key = file_key(&msg.room_id, &msg.file_name);
        match msg.msg_type {
            MessageType::Update => self.merge_remote(&key, &msg.payload, false),
            MessageType::ReplySync => self.merge_remote(&key, &msg.payload, true),
            MessageType::RequestSync => {
                // Only a caught-up replica answers; a half-synced one could
                // hand out an empty state and stop the requester's store load.
                let state = self
                    .sessions
                    .get(&key)
                    .filter(|s| s.state() == FileState::Live)
                    .map(FileSession::full_state);
                if let Some(state) = state {
                    self.send(&SyncMessage::file_sync_response(msg.peer_id, &key.0, &key.1, state));
                }
            }
            MessageType::SaveFinal => {
                if self.sessions.contains_key(&key) {
                    log::info!("Relay requested final save of {}/{}", key.0, key.1);
                    self.emit(ClientEvent::FinalSaveRequested {
                        room_id: key.0.clone(),
                        file_name: key.1.clone(),
                    });
                    self.start_save(&key, true);
                }
            }
            MessageType::StatusReport => {
                if let Some(waiter) = self.status_waiters.pop_front() {
                    let _ = waiter.send(msg.relay_status().map_err(ClientError::from));
                }
            }
            MessageType::Ping => {
                self.send(&SyncMessage::pong());
            }
            MessageType::Pong => log::trace!("Pong from relay"),
            other => log::debug!("Ignoring {other:?} from relay"),
        }
    }

    fn merge_remote(&mut self, key: &FileKey, payload: &[u8], sync_reply: bool) {
        let Some(session) = self.sessions.get_mut(key) else {
            log::debug!("Update for closed file {}/{}", key.0, key.1);
            return;
        };
        match session.apply_remote(payload) {
            Ok(changed) => {
                let caught_up = sync_reply && session.state() == FileState::AwaitingSync;
                if caught_up {
                    session.sync_timer.cancel();
                }
                // A live peer's full state already contains the stored note.
                let newly_synced = sync_reply && !session.is_synced();
                if sync_reply {
                    session.mark_synced();
                }
                let held_back = newly_synced && session.is_dirty();
                if changed {
                    self.emit(ClientEvent::DocumentChanged {
                        room_id: key.0.clone(),
                        file_name: key.1.clone(),
                        origin: Origin::Remote,
                    });
                }
                if changed || held_back {
                    self.schedule_save(key);
                }
                if caught_up {
                    self.set_file_state(key, FileState::Live);
                }
            }
            Err(e) => {
                self.emit(ClientEvent::MergeFailed {
                    room_id: key.0.clone(),
                    file_name: key.1.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    // ─── Persistence ──────────────────────────────────────────────────

    fn load_persisted(&mut self, key: &FileKey) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if !session.request_persisted() {
            return;
        }
        let session_id = session.id();
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let store = self.store.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let result = store.find_by_key(&key.0, &key.1).await;
            let _ = commands.send(Command::PersistedLoaded {
                key,
                session: session_id,
                result,
            });
        });
    }

    fn on_persisted_loaded(
        &mut self,
        key: &FileKey,
        session_id: u64,
        result: Result<Option<NoteRecord>, StoreError>,
    ) {
        let Some(session) = self.sessions.get_mut(key).filter(|s| s.id() == session_id) else {
            return;
        };
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                // Going live without the stored note would let the next save overwrite it.
                log::warn!("Failed to load {}/{} from store: {e}", key.0, key.1);
                session.persisted_failed();
                let awaiting = session.state() == FileState::AwaitingSync;
                let dirty = session.is_dirty();
                if awaiting {
                    self.arm_sync_timer(key);
                }
                // The debounced save asks for the load again.
                if dirty {
                    self.schedule_save(key);
                }
                return;
            }
        };

        let mut changed = false;
        match record {
            Some(record) => match session.apply_persisted(&record.content) {
                Ok(c) => changed = c,
                Err(e) => {
                    // An undecodable record is replaced by the next save.
                    session.mark_synced();
                    self.emit(ClientEvent::MergeFailed {
                        room_id: key.0.clone(),
                        file_name: key.1.clone(),
                        error: e.to_string(),
                    });
                }
            },
            None => session.mark_synced(),
        }
        let (go_live, dirty) = self.sessions.get(key).map_or((false, false), |s| {
            let awaiting = s.state() == FileState::AwaitingSync && s.sync_timer.current_id().is_none();
            (awaiting, s.is_dirty())
        });

        if changed {
            self.emit(ClientEvent::DocumentChanged {
                room_id: key.0.clone(),
                file_name: key.1.clone(),
                origin: Origin::Remote,
            });
        }
        if dirty {
            self.schedule_save(key);
        }
        if go_live {
            self.set_file_state(key, FileState::Live);
        }
    }

    fn schedule_save(&mut self, key: &FileKey) {
        let armed = self
            .sessions
            .get(key)
            .map_or(true, |s| s.save_timer.current_id().is_some());
        if armed {
            return;
        }
        let timer_key = key.clone();
        let task = self.timer(self.config.save_debounce, move |task| Command::SaveDue { key: timer_key, task });
        if let Some(session) = self.sessions.get_mut(key) {
            session.save_timer.replace(task);
        }
    }

    /// Save an open file. `None` if it is not open or the save was deferred.
    fn start_save(&mut self, key: &FileKey, forced: bool) -> Option<SaveWaiter> {
        let mut session = self.sessions.remove(key)?;
        if forced {
            session.save_timer.cancel();
        }
        let unsynced = !forced && !session.is_synced();
        let waiter = self.begin_save(key, &mut session, forced);
        self.sessions.insert(key.clone(), session);
        if unsynced {
            self.load_persisted(key);
        }
        if forced {
            Some(waiter.unwrap_or_else(|| ready(Ok(()))))
        } else {
            waiter
        }
    }

    fn begin_save(&mut self, key: &FileKey, session: &mut FileSession, forced: bool) -> Option<SaveWaiter> {
        match session.begin_save(forced) {
            SaveDecision::Start(job) => Some(self.spawn_save(key, session.id(), job)),
            SaveDecision::Deferred => {
                log::trace!("Save of {}/{} deferred behind in-flight save", key.0, key.1);
                None
            }
            SaveDecision::Unsynced => {
                log::trace!("Save of {}/{} waits for the stored note", key.0, key.1);
                None
            }
            SaveDecision::Clean => {
                self.emit(ClientEvent::SaveSkipped {
                    room_id: key.0.clone(),
                    file_name: key.1.clone(),
                });
                Some(ready(Ok(())))
            }
        }
    }

    fn spawn_save(&mut self, key: &FileKey, session_id: u64, job: SaveJob) -> SaveWaiter {
        let (tx, rx) = oneshot::channel();
        let Some(commands) = self.commands.upgrade() else {
            let _ = tx.send(Err(ClientError::Stopped));
            return rx;
        };
        let store = self.store.clone();
        let cache = self.cache.clone();
        let lock = self.save_lock(key);
        let key = key.clone();

        tokio::spawn(async move {
            let (text, result) = {
                let _guard = lock.lock().await;
                write_snapshot(store.as_ref(), &cache, &key, job).await
            };
            let _ = commands.send(Command::SaveFinished {
                key,
                session: session_id,
                text,
                result,
                waiter: tx,
            });
        });
        rx
    }

    fn save_lock(&mut self, key: &FileKey) -> Arc<Mutex<()>> {
        self.save_locks.entry(key.clone()).or_default().clone()
    }

    fn on_save_finished(
        &mut self,
        key: &FileKey,
        session_id: u64,
        text: String,
        result: Result<SaveOutcome, StoreError>,
        waiter: Reply<Result<(), ClientError>>,
    ) {
        let open = self
            .sessions
            .get(key)
            .is_some_and(|s| s.id() == session_id);
        let run_deferred = match self.sessions.get_mut(key) {
            Some(session) if open => session.finish_save(text, result.is_ok()),
            _ => false,
        };

        match result {
            Ok(outcome) => {
                log::debug!("Saved {}/{} ({outcome:?})", key.0, key.1);
                self.emit(ClientEvent::Saved {
                    room_id: key.0.clone(),
                    file_name: key.1.clone(),
                    record_id: outcome.record_id(),
                });
                let _ = waiter.send(Ok(()));
            }
            Err(e) => {
                log::warn!("Saving {}/{} failed: {e}", key.0, key.1);
                self.emit(ClientEvent::SaveFailed {
                    room_id: key.0.clone(),
                    file_name: key.1.clone(),
                    error: e.to_string(),
                });
                if open {
                    self.schedule_save(key);
                }
                let _ = waiter.send(Err(e.into()));
            }
        }

        if run_deferred {
            self.start_save(key, false);
        }
    }

    /// Flush, leave and save every file inline, then drop the connection.
    async fn shutdown(&mut self) {
        log::info!("Sync client shutting down ({} open files)", self.sessions.len());
        self.reconnect_timer.cancel();
        self.connecting = false;
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Stopped));
        }

        let keys: Vec<FileKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            let Some(mut session) = self.sessions.remove(&key) else {
                continue;
            };
            session.cancel_timers();
            if session.state() != FileState::Disconnected {
                if let Ok(Some(diff)) = session.take_broadcast_diff() {
                    self.send(&SyncMessage::update(&key.0, &key.1, diff));
                }
                self.send(&SyncMessage::leave_file(&key.0, &key.1));
            }

            match session.begin_save(true) {
                SaveDecision::Start(job) => {
                    let lock = self.save_lock(&key);
                    let (_, result) = {
                        let _guard = lock.lock().await;
                        write_snapshot(self.store.as_ref(), &self.cache, &key, job).await
                    };
                    match result {
                        Ok(outcome) => self.emit(ClientEvent::Saved {
                            room_id: key.0.clone(),
                            file_name: key.1.clone(),
                            record_id: outcome.record_id(),
                        }),
                        Err(e) => {
                            log::error!("Final save of {}/{} failed: {e}", key.0, key.1);
                            self.emit(ClientEvent::SaveFailed {
                                room_id: key.0.clone(),
                                file_name: key.1.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
                SaveDecision::Clean | SaveDecision::Deferred | SaveDecision::Unsynced => self.emit(ClientEvent::SaveSkipped {
                    room_id: key.0.clone(),
                    file_name: key.1.clone(),
                }),
            }
        }

        for waiter in self.status_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::Stopped));
        }
        self.transport = None;
        self.set_connection(ConnectionState::Disconnected).await;
    }
}

/// Write a save job. Returns the text that was written along with the outcome.
///
/// A job taken before the replica synced first merges whatever the store
/// holds, so the write extends the stored note instead of replacing it.
async fn write_snapshot(
    store: &dyn NoteStore,
    cache: &RecordCache,
    key: &FileKey,
    job: SaveJob,
) -> (String, Result<SaveOutcome, StoreError>) {
    let SaveJob {
        mut state,
        mut text,
        merge_stored,
    } = job;
    if merge_stored {
        match store.find_by_key(&key.0, &key.1).await {
            Ok(Some(record)) => match merge_states(&state, &record.content) {
                Ok((merged, merged_text)) => {
                    state = merged;
                    text = merged_text;
                }
                Err(e) => log::warn!("Replacing undecodable stored {}/{}: {e}", key.0, key.1),
            },
            Ok(None) => {}
            Err(e) => return (text, Err(e)),
        }
    }
    let result = save_note(store, cache, &key.0, &key.1, &state).await;
    (text, result)
}

fn merge_states(local: &[u8], stored: &[u8]) -> Result<(Vec<u8>, String), DocumentError> {
    let doc = ReplicatedDocument::from_state(local)?;
    doc.load_full_state(stored)?;
    Ok((doc.encode_full_state(), doc.content()))
}
