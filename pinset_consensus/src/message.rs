//! Peer-to-peer Raft messages.
//!
//! The payloads are openraft's own RPC types; the enums only give the
//! three calls a single shape for a [`Transport`](crate::Transport).

use crate::types::TypeConfig;
use pinset_core::PeerId;
use serde::{Deserialize, Serialize};

pub type VoteRequest = openraft::raft::VoteRequest<PeerId>;
pub type VoteResponse = openraft::raft::VoteResponse<PeerId>;
pub type AppendRequest = openraft::raft::AppendEntriesRequest<TypeConfig>;
pub type AppendResponse = openraft::raft::AppendEntriesResponse<PeerId>;
pub type SnapshotRequest = openraft::raft::InstallSnapshotRequest<TypeConfig>;
pub type SnapshotResponse = openraft::raft::InstallSnapshotResponse<PeerId>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    Vote(VoteRequest),
    Append(AppendRequest),
    InstallSnapshot(SnapshotRequest),
}

impl RaftRequest {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRequest::Vote(_) => "vote",
            RaftRequest::Append(_) => "append",
            RaftRequest::InstallSnapshot(_) => "install_snapshot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftResponse {
    Vote(VoteResponse),
    Append(AppendResponse),
    InstallSnapshot(SnapshotResponse),
}

impl RaftResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            RaftResponse::Vote(_) => "vote",
            RaftResponse::Append(_) => "append",
            RaftResponse::InstallSnapshot(_) => "install_snapshot",
        }
    }
}
