//! # roomnote-core: replicated text documents for room notes
//!
//! A room note is a plain text buffer edited concurrently by every
//! client that has the same `(room, file)` pair open. Each client holds
//! its own [`ReplicatedDocument`]; replicas exchange opaque yrs updates
//! and converge regardless of delivery order or duplication.
//!
//! ```text
//!  local edit ──► ReplicatedDocument ──► Operation { Local, bytes } ──► relay
//!                        ▲
//!  relay ──► apply_remote_operation(bytes) ──► Operation origin = Remote
//! ```
//!
//! The origin tag exists only so the sync layer does not re-broadcast
//! what it just received. Ordering comes from the CRDT itself.

pub mod document;

pub use document::{DocumentError, Operation, Origin, ReplicatedDocument, TEXT_NAME};
