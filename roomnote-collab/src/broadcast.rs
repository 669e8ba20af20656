//! Per-connection outbound channels with backpressure.
//!
//! Every accepted socket gets a bounded mpsc channel; its connection
//! task drains the channel into the WebSocket. Routing (unicast or
//! fan-out to a file's editor set) waits at most `send_timeout` for room
//! in a full queue. A socket that stays full is removed from the table:
//! its task closes the WebSocket, and the client's rejoin resyncs the
//! full document, so no relayed update is silently lost.
//!
//! A connection whose task is gone has a closed channel. The sweep uses
//! that as the liveness signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{ProtocolError, SyncMessage};
use crate::registry::ConnId;

/// Encoded frame shared between every target of one fan-out.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct FanOutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    /// Connections removed because their queue stayed full
    pub slow_disconnects: u64,
    pub active_connections: usize,
}

/// Lock-free counters; read via [`ConnectionTable::stats`].
struct AtomicFanOutStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    slow_disconnects: AtomicU64,
}

impl AtomicFanOutStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            slow_disconnects: AtomicU64::new(0),
        }
    }
}

/// All open transport connections of the relay.
pub struct ConnectionTable {
    senders: RwLock<HashMap<ConnId, mpsc::Sender<Frame>>>,
    /// Channel capacity (frames buffered per connection)
    capacity: usize,
    /// How long a full queue may block delivery before its connection is dropped
    send_timeout: Duration,
    atomic_stats: AtomicFanOutStats,
}

impl ConnectionTable {
    pub fn new(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            capacity,
            send_timeout,
            atomic_stats: AtomicFanOutStats::new(),
        }
    }

    /// Register a connection and return the receiver its task drains.
    pub async fn register(&self, conn: ConnId) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.write().await.insert(conn, tx);
        rx
    }

    pub async fn remove(&self, conn: &ConnId) -> bool {
        self.senders.write().await.remove(conn).is_some()
    }

    /// Encode once and send to a single connection.
    pub async fn send_to(&self, conn: ConnId, msg: &SyncMessage) -> Result<bool, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.send_frame(&[conn], frame).await == 1)
    }

    /// Encode once and send to every listed connection.
    pub async fn fan_out(&self, conns: &[ConnId], msg: &SyncMessage) -> Result<usize, ProtocolError> {
        if conns.is_empty() {
            return Ok(0);
        }
        let frame = Arc::new(msg.encode()?);
        Ok(self.send_frame(conns, frame).await)
    }

    /// Send pre-encoded bytes (relayed updates are forwarded untouched).
    ///
    /// Returns the number of connections that accepted the frame.
    /// Connections still full after `send_timeout` are removed.
    pub async fn send_frame(&self, conns: &[ConnId], frame: Frame) -> usize {
        let targets: Vec<(ConnId, mpsc::Sender<Frame>)> = {
            let senders = self.senders.read().await;
            conns
                .iter()
                .filter_map(|conn| senders.get(conn).map(|tx| (*conn, tx.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut stalled = Vec::new();
        for (conn, tx) in targets {
            let result = match tx.try_send(frame.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(frame)) => tx.send_timeout(frame, self.send_timeout).await,
                Err(TrySendError::Closed(frame)) => Err(SendTimeoutError::Closed(frame)),
            };
            match result {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Outbound queue of connection {conn} stayed full, disconnecting it");
                    stalled.push(conn);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Connection {conn} closed before delivery");
                }
            }
        }

        if !stalled.is_empty() {
            let mut senders = self.senders.write().await;
            for conn in &stalled {
                senders.remove(conn);
            }
            self.atomic_stats
                .slow_disconnects
                .fetch_add(stalled.len() as u64, Ordering::Relaxed);
        }
        self.atomic_stats
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// A connection is alive while its task still holds the receiver.
    pub async fn is_alive(&self, conn: &ConnId) -> bool {
        self.senders
            .read()
            .await
            .get(conn)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Ids of every live connection.
    pub async fn live_ids(&self) -> Vec<ConnId> {
        self.senders
            .read()
            .await
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.senders.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> FanOutStats {
        FanOutStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            slow_disconnects: self.atomic_stats.slow_disconnects.load(Ordering::Relaxed),
            active_connections: self.senders.read().await.len(),
        }
    }
}
