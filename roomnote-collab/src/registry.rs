//! In-memory directory of who is editing what.
//!
//! ```text
//! RelayRegistry
//!   └── room_id ─► RelayRoom
//!                   ├── files:       file_name ─► {conn_id}
//!                   └── connections: conn_id   ─► {file_name}
//! ```
//!
//! Rooms and file entries exist only while some connection references
//! them. Every transition of a file's editor set from 1 to 0 yields
//! exactly one [`FinalSave`]; the caller decides whom to notify.

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::protocol::RoomStatus;

/// Relay-assigned connection id.
pub type ConnId = Uuid;

/// The last editor of `(room_id, file_name)` is gone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FinalSave {
    pub room_id: String,
    pub file_name: String,
}

/// Editors of one room.
#[derive(Debug, Default)]
pub struct RelayRoom {
    files: HashMap<String, HashSet<ConnId>>,
    connections: HashMap<ConnId, HashSet<String>>,
}

impl RelayRoom {
    /// Remove `conn` from `file_name`. Returns true when the file lost its last editor.
    fn leave(&mut self, conn: ConnId, file_name: &str) -> bool {
        let mut emptied = false;
        if let Some(editors) = self.files.get_mut(file_name) {
            if editors.remove(&conn) && editors.is_empty() {
                self.files.remove(file_name);
                emptied = true;
            }
        }
        if let Some(files) = self.connections.get_mut(&conn) {
            files.remove(file_name);
            if files.is_empty() {
                self.connections.remove(&conn);
            }
        }
        emptied
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn socket_count(&self) -> usize {
        self.connections.len()
    }

    pub fn editor_count(&self, file_name: &str) -> usize {
        self.files.get(file_name).map_or(0, HashSet::len)
    }

    fn status(&self, room_id: &str) -> RoomStatus {
        RoomStatus {
            room_id: room_id.to_string(),
            socket_count: self.connections.len(),
            files: self
                .files
                .iter()
                .map(|(name, editors)| (name.clone(), editors.len()))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

/// Room/file/connection registry owned by the relay.
#[derive(Debug, Default)]
pub struct RelayRegistry {
    rooms: HashMap<String, RelayRoom>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` as an editor of `(room_id, file_name)`.
    ///
    /// Returns false if it was already registered.
    pub fn join(&mut self, room_id: &str, file_name: &str, conn: ConnId) -> bool {
        let room = self.rooms.entry(room_id.to_string()).or_default();
        let added = room
            .files
            .entry(file_name.to_string())
            .or_default()
            .insert(conn);
        room.connections
            .entry(conn)
            .or_default()
            .insert(file_name.to_string());
        added
    }

    /// Deregister `conn` from one file.
    pub fn leave(&mut self, room_id: &str, file_name: &str, conn: ConnId) -> Option<FinalSave> {
        let room = self.rooms.get_mut(room_id)?;
        let emptied = room.leave(conn, file_name);
        if room.is_empty() {
            self.rooms.remove(room_id);
        }
        emptied.then(|| FinalSave {
            room_id: room_id.to_string(),
            file_name: file_name.to_string(),
        })
    }

    /// Deregister `conn` from every file of every room.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<FinalSave> {
        let mut finals = Vec::new();
        for (room_id, room) in self.rooms.iter_mut() {
            let Some(files) = room.connections.get(&conn).cloned() else {
                continue;
            };
            for file_name in files {
                if room.leave(conn, &file_name) {
                    finals.push(FinalSave {
                        room_id: room_id.clone(),
                        file_name,
                    });
                }
            }
        }
        self.rooms.retain(|_, room| !room.is_empty());
        finals
    }

    /// Drop every connection for which `is_alive` is false.
    ///
    /// Returns the swept connection ids and the final saves their
    /// removal caused. Files that keep a live editor never appear.
    pub fn sweep<F>(&mut self, is_alive: F) -> (Vec<ConnId>, Vec<FinalSave>)
    where
        F: Fn(&ConnId) -> bool,
    {
        let dead: Vec<ConnId> = self
            .connection_ids()
            .into_iter()
            .filter(|conn| !is_alive(conn))
            .collect();
        let finals = dead.iter().flat_map(|conn| self.disconnect(*conn)).collect();
        (dead, finals)
    }

    /// Editors of a file other than `except`.
    pub fn other_editors(&self, room_id: &str, file_name: &str, except: ConnId) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .and_then(|room| room.files.get(file_name))
            .map(|editors| editors.iter().copied().filter(|c| *c != except).collect())
            .unwrap_or_default()
    }

    /// Every connection registered anywhere in a room.
    pub fn room_connections(&self, room_id: &str) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|room| room.connections.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_editing(&self, room_id: &str, file_name: &str, conn: ConnId) -> bool {
        self.rooms
            .get(room_id)
            .and_then(|room| room.files.get(file_name))
            .is_some_and(|editors| editors.contains(&conn))
    }

    /// Distinct connections registered in any room.
    pub fn connection_ids(&self) -> Vec<ConnId> {
        let ids: HashSet<ConnId> = self
            .rooms
            .values()
            .flat_map(|room| room.connections.keys().copied())
            .collect();
        ids.into_iter().collect()
    }

    pub fn room(&self, room_id: &str) -> Option<&RelayRoom> {
        self.rooms.get(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn editor_count(&self, room_id: &str, file_name: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.editor_count(file_name))
    }

    /// Per-room snapshot, sorted by room id.
    pub fn room_statuses(&self) -> Vec<RoomStatus> {
        let mut rooms: Vec<RoomStatus> = self
            .rooms
            .iter()
            .map(|(id, room)| room.status(id))
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }
}
