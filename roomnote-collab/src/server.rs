//! WebSocket relay with (room, file) routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── outbound mpsc ──► Client A
//!             ├── dispatch ── RelayRegistry
//! Client B ──┘       │         (who edits what)  └── outbound mpsc ──► Client B
//!                    │
//!                    └── ConnectionTable (per-socket bounded channels)
//! ```
//!
//! The relay holds no document state. It forwards updates between the
//! editors of one file, brokers catch-up (`RequestFileSync` →
//! `RequestSync` → `FileSyncResponse` → `ReplySync`), and tells the rest
//! of a room when a file loses its last editor (`SaveFinal`).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{ConnectionTable, Frame};
use crate::protocol::{MessageType, ProtocolError, RelayStatus, SyncMessage};
use crate::registry::{ConnId, FinalSave, RelayRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before drops
    pub outbound_capacity: usize,
    /// Interval between dead-connection sweeps
    pub sweep_interval: Duration,
    /// How long delivery waits on a full queue before dropping the connection
    pub send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            sweep_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short sweep interval.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbound_capacity: 64,
            sweep_interval: Duration::from_millis(200),
            send_timeout: Duration::from_millis(200),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub final_saves_emitted: u64,
    pub swept_connections: u64,
}

/// Result of one registry sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub swept: Vec<ConnId>,
    pub final_saves: Vec<FinalSave>,
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The relay. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RwLock<RelayRegistry>>,
    connections: Arc<ConnectionTable>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let connections = Arc::new(ConnectionTable::new(config.outbound_capacity, config.send_timeout));
        Self {
            config,
            registry: Arc::new(RwLock::new(RelayRegistry::new())),
            connections,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until the accept loop fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Bind, then serve on a background task. Returns the bound address.
    pub async fn spawn(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let server = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                log::error!("Relay stopped: {e}");
            }
        });
        Ok((addr, handle))
    }

    /// Accept connections from `listener`; runs the periodic sweep alongside.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let sweeper = self.spawn_sweeper();
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let server = self.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = server.sweep().await;
                if !report.swept.is_empty() {
                    log::info!(
                        "Sweep removed {} dead connections, {} final saves",
                        report.swept.len(),
                        report.final_saves.len()
                    );
                }
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let conn = Uuid::new_v4();
        let outbound = self.connections.register(conn).await;
        log::info!("Connection {conn} established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self.pump(conn, ws_stream, outbound).await;

        self.disconnect(conn).await;
        log::info!("Connection {conn} from {addr} closed");
        result
    }

    /// Move frames between the socket and the dispatcher until either side closes.
    async fn pump(
        &self,
        conn: ConnId,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut outbound: mpsc::Receiver<Frame>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            self.dispatch(conn, &bytes).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        // Removed from the table by a sweep or a stalled send.
                        None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Route one inbound frame from `conn`.
    pub async fn dispatch(&self, conn: ConnId, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {conn}: {e}");
                return;
            }
        };

        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        if let Err(e) = self.route(conn, msg, bytes).await {
            log::warn!("Failed to route message from {conn}: {e}");
        }
    }

    async fn route(&self, conn: ConnId, msg: SyncMessage, raw: &[u8]) -> Result<(), ProtocolError> {
        let room = msg.room_id.as_str();
        let file = msg.file_name.as_str();

        match msg.msg_type {
            MessageType::JoinFile => {
                let added = self.registry.write().await.join(room, file, conn);
                if added {
                    log::debug!("{conn} joined {room}/{file}");
                }
            }

            MessageType::LeaveFile => {
                let notice = {
                    let mut registry = self.registry.write().await;
                    registry
                        .leave(room, file, conn)
                        .map(|save| (registry.room_connections(room), save))
                };
                log::debug!("{conn} left {room}/{file}");
                if let Some(notice) = notice {
                    self.emit_final_saves(vec![notice]).await?;
                }
            }

            MessageType::Update => {
                let targets = {
                    let registry = self.registry.read().await;
                    if !registry.is_editing(room, file, conn) {
                        log::debug!("Dropping update from {conn}: not editing {room}/{file}");
                        return Ok(());
                    }
                    registry.other_editors(room, file, conn)
                };
                let delivered = self.connections.send_frame(&targets, Arc::new(raw.to_vec())).await;
                log::trace!("Update on {room}/{file} relayed to {delivered}/{}", targets.len());
            }

            MessageType::RequestFileSync => {
                let targets = self.registry.read().await.other_editors(room, file, conn);
                log::debug!("{conn} requests sync of {room}/{file} from {} peers", targets.len());
                self.connections
                    .fan_out(&targets, &SyncMessage::request_sync(conn, room, file))
                    .await?;
            }

            MessageType::FileSyncResponse => {
                let target = msg.peer_id;
                {
                    let registry = self.registry.read().await;
                    if !registry.is_editing(room, file, conn) {
                        log::debug!("Dropping sync response from {conn}: not editing {room}/{file}");
                        return Ok(());
                    }
                    if !registry.is_editing(room, file, target) {
                        log::debug!("Sync response for {target} on {room}/{file} has no recipient");
                        return Ok(());
                    }
                }
                self.connections
                    .send_to(target, &SyncMessage::reply_sync(room, file, msg.payload))
                    .await?;
            }

            MessageType::StatusRequest => {
                let status = self.status().await;
                self.connections
                    .send_to(conn, &SyncMessage::status_report(&status)?)
                    .await?;
            }

            MessageType::Ping => {
                self.connections.send_to(conn, &SyncMessage::pong()).await?;
            }

            MessageType::Pong => {
                log::trace!("Pong from {conn}");
            }

            MessageType::RequestSync
            | MessageType::ReplySync
            | MessageType::SaveFinal
            | MessageType::StatusReport => {
                log::debug!("Ignoring relay-only message {:?} from {conn}", msg.msg_type);
            }
        }
        Ok(())
    }

    /// Deregister `conn` everywhere and notify rooms of emptied files.
    pub async fn disconnect(&self, conn: ConnId) {
        self.connections.remove(&conn).await;
        let notices = {
            let mut registry = self.registry.write().await;
            let finals = registry.disconnect(conn);
            finals
                .into_iter()
                .map(|save| (registry.room_connections(&save.room_id), save))
                .collect::<Vec<_>>()
        };
        if let Err(e) = self.emit_final_saves(notices).await {
            log::warn!("Failed to announce final saves for {conn}: {e}");
        }

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    /// Drop registry entries of connections whose outbound channel is closed.
    pub async fn sweep(&self) -> SweepReport {
        let live: HashSet<ConnId> = self.connections.live_ids().await.into_iter().collect();
        let (swept, notices) = {
            let mut registry = self.registry.write().await;
            let (swept, finals) = registry.sweep(|conn| live.contains(conn));
            let notices = finals
                .into_iter()
                .map(|save| (registry.room_connections(&save.room_id), save))
                .collect::<Vec<_>>();
            (swept, notices)
        };

        for conn in &swept {
            self.connections.remove(conn).await;
        }
        let final_saves = notices.iter().map(|(_, save)| save.clone()).collect();
        if let Err(e) = self.emit_final_saves(notices).await {
            log::warn!("Failed to announce final saves after sweep: {e}");
        }

        self.stats.write().await.swept_connections += swept.len() as u64;
        SweepReport { swept, final_saves }
    }

    async fn emit_final_saves(&self, notices: Vec<(Vec<ConnId>, FinalSave)>) -> Result<(), ProtocolError> {
        for (targets, save) in notices {
            log::info!(
                "{}/{} lost its last editor, notifying {} connections",
                save.room_id,
                save.file_name,
                targets.len()
            );
            self.stats.write().await.final_saves_emitted += 1;
            self.connections
                .fan_out(&targets, &SyncMessage::save_final(&save.room_id, &save.file_name))
                .await?;
        }
        Ok(())
    }

    /// Read-only snapshot of sockets, rooms and editors.
    pub async fn status(&self) -> RelayStatus {
        let connected_sockets = self.connections.len().await;
        let registry = self.registry.read().await;
        RelayStatus {
            connected_sockets,
            active_rooms: registry.room_count(),
            rooms: registry.room_statuses(),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }
}
