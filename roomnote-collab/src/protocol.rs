//! Binary protocol between sync clients and the relay.
//!
//! One bincode-encoded [`SyncMessage`] per WebSocket binary frame:
//! ```text
//! ┌──────────┬──────────┬───────────┬───────────┬──────────┐
//! │ msg_type │ room_id  │ file_name │ peer_id   │ payload  │
//! │ 1 byte   │ string   │ string    │ 16 bytes  │ variable │
//! └──────────┴──────────┴───────────┴───────────┴──────────┘
//! ```
//!
//! `peer_id` is a relay-assigned connection id. It names the requester
//! on `RequestSync` and the target on `FileSyncResponse`; it is nil
//! everywhere else. Clients never learn or send their own id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client starts editing a file
    JoinFile = 1,
    /// Client stops editing a file
    LeaveFile = 2,
    /// Encoded document operation
    Update = 3,
    /// Client asks the relay to collect state from other editors
    RequestFileSync = 4,
    /// Relay asks one editor for its state on behalf of `peer_id`
    RequestSync = 5,
    /// Editor's answer to `RequestSync`, addressed to `peer_id`
    FileSyncResponse = 6,
    /// Relay forwards a `FileSyncResponse` to its target only
    ReplySync = 7,
    /// The last editor of a file left
    SaveFinal = 8,
    /// Diagnostic status query
    StatusRequest = 9,
    /// Diagnostic status answer (payload: bincode `RelayStatus`)
    StatusReport = 10,
    /// Heartbeat ping
    Ping = 11,
    /// Heartbeat pong
    Pong = 12,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub room_id: String,
    pub file_name: String,
    pub peer_id: Uuid,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn file_scoped(msg_type: MessageType, room_id: &str, file_name: &str) -> Self {
        Self {
            msg_type,
            room_id: room_id.to_string(),
            file_name: file_name.to_string(),
            peer_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    fn bare(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            room_id: String::new(),
            file_name: String::new(),
            peer_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    pub fn join_file(room_id: &str, file_name: &str) -> Self {
        Self::file_scoped(MessageType::JoinFile, room_id, file_name)
    }

    pub fn leave_file(room_id: &str, file_name: &str) -> Self {
        Self::file_scoped(MessageType::LeaveFile, room_id, file_name)
    }

    /// Create an update message carrying an encoded operation.
    pub fn update(room_id: &str, file_name: &str, operation: Vec<u8>) -> Self {
        Self {
            payload: operation,
            ..Self::file_scoped(MessageType::Update, room_id, file_name)
        }
    }

    pub fn request_file_sync(room_id: &str, file_name: &str) -> Self {
        Self::file_scoped(MessageType::RequestFileSync, room_id, file_name)
    }

    /// Relay → editor: produce your state for `requester`.
    pub fn request_sync(requester: Uuid, room_id: &str, file_name: &str) -> Self {
        Self {
            peer_id: requester,
            ..Self::file_scoped(MessageType::RequestSync, room_id, file_name)
        }
    }

    /// Editor → relay: full state for `target`.
    pub fn file_sync_response(target: Uuid, room_id: &str, file_name: &str, state: Vec<u8>) -> Self {
        Self {
            peer_id: target,
            payload: state,
            ..Self::file_scoped(MessageType::FileSyncResponse, room_id, file_name)
        }
    }

    /// Relay → requester: a peer's full state.
    pub fn reply_sync(room_id: &str, file_name: &str, state: Vec<u8>) -> Self {
        Self {
            payload: state,
            ..Self::file_scoped(MessageType::ReplySync, room_id, file_name)
        }
    }

    pub fn save_final(room_id: &str, file_name: &str) -> Self {
        Self::file_scoped(MessageType::SaveFinal, room_id, file_name)
    }

    pub fn status_request() -> Self {
        Self::bare(MessageType::StatusRequest)
    }

    pub fn status_report(status: &RelayStatus) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(status, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            payload,
            ..Self::bare(MessageType::StatusReport)
        })
    }

    pub fn ping() -> Self {
        Self::bare(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(MessageType::Pong)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a status report payload.
    pub fn relay_status(&self) -> Result<RelayStatus, ProtocolError> {
        if self.msg_type != MessageType::StatusReport {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (status, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(status)
    }
}

/// Read-only snapshot of one relay room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomStatus {
    pub room_id: String,
    /// Connections registered in the room
    pub socket_count: usize,
    /// Editor count per file
    pub files: BTreeMap<String, usize>,
}

/// Read-only snapshot of the whole relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    /// Open transport connections, registered in a room or not
    pub connected_sockets: usize,
    pub active_rooms: usize,
    pub rooms: Vec<RoomStatus>,
}

impl RelayStatus {
    /// Editor count for a file, 0 when the file entry does not exist.
    pub fn editors(&self, room_id: &str, file_name: &str) -> usize {
        self.rooms
            .iter()
            .find(|r| r.room_id == room_id)
            .and_then(|r| r.files.get(file_name).copied())
            .unwrap_or(0)
    }

    pub fn room(&self, room_id: &str) -> Option<&RoomStatus> {
        self.rooms.iter().find(|r| r.room_id == room_id)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let op = vec![1, 2, 3, 4, 5];
        let msg = SyncMessage::update("room-1", "notes.md", op.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.room_id, "room-1");
        assert_eq!(decoded.file_name, "notes.md");
        assert!(decoded.peer_id.is_nil());
        assert_eq!(decoded.payload, op);
    }

    #[test]
    fn test_request_sync_carries_requester() {
        let requester = Uuid::new_v4();
        let msg = SyncMessage::request_sync(requester, "r", "f");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::RequestSync);
        assert_eq!(decoded.peer_id, requester);
        assert_eq!(decoded.file_name, "f");
    }

    #[test]
    fn test_file_sync_response_carries_target_and_state() {
        let target = Uuid::new_v4();
        let msg = SyncMessage::file_sync_response(target, "r", "f", vec![9; 40]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::FileSyncResponse);
        assert_eq!(decoded.peer_id, target);
        assert_eq!(decoded.payload.len(), 40);
    }

    #[test]
    fn test_status_report_payload() {
        let mut files = BTreeMap::new();
        files.insert("x".to_string(), 2);
        let status = RelayStatus {
            connected_sockets: 3,
            active_rooms: 1,
            rooms: vec![RoomStatus {
                room_id: "r".into(),
                socket_count: 2,
                files,
            }],
        };

        let msg = SyncMessage::status_report(&status).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let parsed = decoded.relay_status().unwrap();

        assert_eq!(parsed, status);
        assert_eq!(parsed.editors("r", "x"), 2);
        assert_eq!(parsed.editors("r", "missing"), 0);
        assert_eq!(parsed.editors("other", "x"), 0);
    }

    #[test]
    fn test_relay_status_rejects_wrong_type() {
        assert!(SyncMessage::ping().relay_status().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::JoinFile as u8, 1);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::ReplySync as u8, 7);
        assert_eq!(MessageType::SaveFinal as u8, 8);
        assert_eq!(MessageType::Pong as u8, 12);
    }

    #[test]
    fn test_large_update() {
        // Full-state snapshots of long notes travel as one frame.
        let state = vec![42u8; 65536];
        let msg = SyncMessage::update("r", "f", state.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, state);
    }
}
