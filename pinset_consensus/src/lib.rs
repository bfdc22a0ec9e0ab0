//! Raft consensus for the replicated pin/unpin log.
//!
//! A [`Raft`] handle fronts one replica running on openraft. The replica
//! persists through a [`LogStore`](pinset_core::LogStore) wrapped in
//! [`LogStorage`], talks to peers through a [`Transport`] wrapped in
//! [`Network`], and feeds committed operations in commit order to an
//! [`Applier`] that mutates the local [`PinState`](pinset_core::PinState).

pub mod api;
pub mod applier;
pub mod config;
pub mod error;
pub mod message;
pub mod sim;
pub mod snapshot;
pub mod storage;
pub mod transport;
pub mod types;

pub use api::{Raft, RaftStatus, Role};
pub use applier::Applier;
pub use config::{ConfigError, RaftConfig};
pub use error::ConsensusError;
pub use message::{RaftRequest, RaftResponse};
pub use sim::{SimNetwork, SimTransport};
pub use storage::LogStorage;
pub use transport::{Network, Transport, TransportError};
pub use types::TypeConfig;
