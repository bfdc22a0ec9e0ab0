//! iroh networking for pinset replicas.
//!
//! Two irpc protocols run over an [`iroh::Endpoint`]:
//!
//! - [`RAFT_ALPN`]: replica-to-replica consensus traffic. [`RaftServer`]
//!   feeds incoming messages into a local [`pinset_consensus::Raft`];
//!   [`IrohTransport`] is the matching [`pinset_consensus::Transport`].
//! - [`API_ALPN`]: the client API. [`ApiServer`] exposes pin/unpin, reads
//!   and cluster administration; [`ApiClient`] calls it.
//!
//! Replicas are identified by their iroh endpoint id, which is a 32 byte
//! ed25519 public key and maps one-to-one onto [`PeerId`].

use anyhow::{Result, anyhow};
use iroh::EndpointId;
use pinset_core::PeerId;

mod api;
mod raft;

pub use api::{ApiClient, ApiError, ApiProto, ApiServer};
pub use raft::{IrohTransport, RaftProto, RaftServer};

pub const RAFT_ALPN: &[u8] = b"pinset/raft/0";
pub const API_ALPN: &[u8] = b"pinset/api/0";

pub fn peer_id(id: &EndpointId) -> PeerId {
    PeerId::from_bytes(*id.as_bytes())
}

pub fn endpoint_id(peer: &PeerId) -> Result<EndpointId> {
    EndpointId::from_bytes(peer.as_bytes())
        .map_err(|err| anyhow!("peer {peer} is not a valid endpoint id: {err}"))
}
