//! # roomnote-collab: Real-time sync for shared room notes
//!
//! Every participant of a room holds a full replica of each open note and
//! exchanges CRDT updates through a thin relay. The relay keeps no
//! document state; it only knows who is editing what.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │ (relay)     │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ FileSession │                     │RelayRegistry│
//! │ (replica)   │                     │ (who edits) │
//! └──────┬──────┘                     └─────────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ NoteStore   │
//! │ (durable)   │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`registry`]: Room/file/editor bookkeeping and final-save detection
//! - [`broadcast`]: Per-connection outbound queues with backpressure
//! - [`server`]: WebSocket relay
//! - [`session`]: Per-file replica and save accounting
//! - [`scheduler`]: Cancellable one-shot timers
//! - [`client`]: WebSocket sync client
//! - [`storage`]: Note persistence (memory and RocksDB)

pub mod protocol;
pub mod registry;
pub mod broadcast;
pub mod scheduler;
pub mod session;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use protocol::{MessageType, ProtocolError, RelayStatus, RoomStatus, SyncMessage};
pub use registry::{ConnId, FinalSave, RelayRegistry};
pub use broadcast::{ConnectionTable, FanOutStats};
pub use scheduler::{ScheduledTask, TaskId, TaskSlot};
pub use session::{FileKey, FileSession, FileState};
pub use server::{ServerConfig, ServerError, ServerStats, SweepReport, SyncServer};
pub use client::{ClientConfig, ClientError, ClientEvent, ConnectionState, Lifecycle, SyncClient};
pub use storage::{
    save_note, MemoryNoteStore, NoteRecord, NoteStore, RecordCache, RecordId, RocksNoteStore,
    SaveOutcome, StoreConfig, StoreError,
};
