//! Delivery of Raft messages to peers, and its openraft network binding.

use crate::message::{
    AppendRequest, AppendResponse, RaftRequest, RaftResponse, SnapshotRequest, SnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::types::TypeConfig;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::EmptyNode;
use pinset_core::PeerId;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {} is unreachable", .0.fmt_short())]
    Unreachable(PeerId),
    #[error("message dropped")]
    Dropped,
    #[error("rpc timed out")]
    Timeout,
    #[error("remote error: {0}")]
    Remote(String),
}

/// Request/response delivery of Raft messages to a peer.
///
/// Delivery is unreliable: a request may fail, be lost after the peer
/// processed it, be duplicated or arrive out of order. The protocol only
/// relies on responses it actually receives.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: PeerId, request: RaftRequest)
    -> Result<RaftResponse, TransportError>;
}

type RpcError<E = RaftError<PeerId>> = RPCError<PeerId, EmptyNode, E>;

/// Hands openraft one [`PeerConnection`] per target, all sharing a
/// [`Transport`].
#[derive(Clone)]
pub struct Network {
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl Network {
    pub fn new(transport: Arc<dyn Transport>, rpc_timeout: Duration) -> Self {
        Self {
            transport,
            rpc_timeout,
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = PeerConnection;

    async fn new_client(&mut self, target: PeerId, _node: &EmptyNode) -> PeerConnection {
        PeerConnection {
            target,
            transport: self.transport.clone(),
            rpc_timeout: self.rpc_timeout,
        }
    }
}

pub struct PeerConnection {
    target: PeerId,
    transport: Arc<dyn Transport>,
    rpc_timeout: Duration,
}

impl PeerConnection {
    async fn send(&self, request: RaftRequest) -> Result<RaftResponse, TransportError> {
        let kind = request.kind();
        let sent = tokio::time::timeout(self.rpc_timeout, self.transport.send(self.target, request));
        let err = match sent.await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => err,
            Err(_) => TransportError::Timeout,
        };
        tracing::trace!(peer = %self.target.fmt_short(), kind, "raft rpc failed: {err}");
        Err(err)
    }
}

/// Unreachable peers make openraft back off; anything else is retried.
fn rpc_error<E: std::error::Error>(err: TransportError) -> RpcError<E> {
    match err {
        TransportError::Unreachable(_) => RPCError::Unreachable(Unreachable::new(&err)),
        _ => RPCError::Network(NetworkError::new(&err)),
    }
}

fn unexpected<E: std::error::Error>(expected: &str, got: &RaftResponse) -> RpcError<E> {
    rpc_error(TransportError::Remote(format!(
        "expected {expected} response, got {}",
        got.kind()
    )))
}

impl RaftNetwork<TypeConfig> for PeerConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendRequest,
        _option: RPCOption,
    ) -> Result<AppendResponse, RpcError> {
        match self.send(RaftRequest::Append(rpc)).await {
            Ok(RaftResponse::Append(response)) => Ok(response),
            Ok(other) => Err(unexpected("append", &other)),
            Err(err) => Err(rpc_error(err)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: SnapshotRequest,
        _option: RPCOption,
    ) -> Result<SnapshotResponse, RpcError<RaftError<PeerId, InstallSnapshotError>>> {
        match self.send(RaftRequest::InstallSnapshot(rpc)).await {
            Ok(RaftResponse::InstallSnapshot(response)) => Ok(response),
            Ok(other) => Err(unexpected("install_snapshot", &other)),
            Err(err) => Err(rpc_error(err)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest,
        _option: RPCOption,
    ) -> Result<VoteResponse, RpcError> {
        match self.send(RaftRequest::Vote(rpc)).await {
            Ok(RaftResponse::Vote(response)) => Ok(response),
            Ok(other) => Err(unexpected("vote", &other)),
            Err(err) => Err(rpc_error(err)),
        }
    }
}
