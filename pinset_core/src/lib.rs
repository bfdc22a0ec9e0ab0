//! Core pinset types and traits.
//!
//! This crate defines the data shared by every pinset crate: the replicated
//! state and the records that mutate it.
//!
//! ## Replicated data (log-stable)
//!
//! The following types are written into the replicated log or into state
//! snapshots; changing their encoding is a protocol change:
//!
//! - Content identifiers (`cid::Cid`) and their canonical string form
//! - Pins and their serial form (`pin::Pin`, `pin::PinSerial`)
//! - Operation records (`op::LogOp`)
//! - Log entries, hard state and snapshot metadata (`log::LogEntry`, ...)
//!
//! ## Contracts
//!
//! - [`PinState`]: the capability set of the authoritative pin mapping,
//!   with [`MapState`] as the in-memory implementation.
//! - [`LogStore`]: the durable append-only log with snapshot support that
//!   the consensus engine persists into. Implementations live in
//!   `pinset_logstore_memory` and `pinset_logstore_redb`.

pub mod cid;
pub mod log;
pub mod op;
pub mod peer;
pub mod pin;
pub mod state;

// Test utilities (behind feature flag)
#[cfg(feature = "testutil")]
pub mod testutil;

pub use cid::{Cid, CidError};
pub use log::{EntryId, EntryPayload, HardState, LogEntry, LogStore, Membership, SnapshotMeta};
pub use op::{ApplyError, LogOp, LogOpKind};
pub use peer::PeerId;
pub use pin::{Pin, PinError, PinSerial, ReplicationFactor};
pub use state::{MapState, PinState, StateError};
