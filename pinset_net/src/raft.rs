use crate::{RAFT_ALPN, endpoint_id, peer_id};
use anyhow::Result;
use dashmap::DashMap;
use iroh::{
    EndpointAddr,
    endpoint::{Connection, Endpoint},
    protocol::{AcceptError, ProtocolHandler},
};
use irpc::{Client as IrpcClient, channel::oneshot, rpc_requests};
use irpc_iroh::{IrohRemoteConnection, read_request};
use pinset_consensus::{
    ConsensusError, Raft, RaftRequest, RaftResponse, Transport, TransportError,
    message::{AppendRequest, SnapshotRequest, VoteRequest},
};
use pinset_core::PeerId;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
#[rpc_requests(message = RaftRpcMessage)]
pub enum RaftProto {
    #[rpc(tx = oneshot::Sender<Result<RaftResponse, ConsensusError>>)]
    Vote(VoteRequest),
    #[rpc(tx = oneshot::Sender<Result<RaftResponse, ConsensusError>>)]
    Append(AppendRequest),
    #[rpc(tx = oneshot::Sender<Result<RaftResponse, ConsensusError>>)]
    InstallSnapshot(SnapshotRequest),
}

/// Feeds consensus traffic from other replicas into the local [`Raft`].
#[derive(Clone)]
pub struct RaftServer {
    raft: Raft,
}

impl fmt::Debug for RaftServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftServer")
            .field("peer", &self.raft.id())
            .finish()
    }
}

impl RaftServer {
    pub fn new(raft: Raft) -> Self {
        Self { raft }
    }
}

impl ProtocolHandler for RaftServer {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        while let Some(msg) = read_request::<RaftProto>(&conn).await? {
            match msg {
                RaftRpcMessage::Vote(irpc::WithChannels { inner, tx, .. }) => {
                    let result = self.raft.handle_request(RaftRequest::Vote(inner)).await;
                    let _ = tx.send(result).await;
                }
                RaftRpcMessage::Append(irpc::WithChannels { inner, tx, .. }) => {
                    let result = self.raft.handle_request(RaftRequest::Append(inner)).await;
                    let _ = tx.send(result).await;
                }
                RaftRpcMessage::InstallSnapshot(irpc::WithChannels { inner, tx, .. }) => {
                    let result = self
                        .raft
                        .handle_request(RaftRequest::InstallSnapshot(inner))
                        .await;
                    let _ = tx.send(result).await;
                }
            }
        }
        conn.closed().await;
        Ok(())
    }
}

/// [`Transport`] that reaches other replicas over iroh.
///
/// Peers are dialed by endpoint id. Addresses registered with
/// [`IrohTransport::add_addr`] are used as dialing hints; otherwise the
/// endpoint's discovery resolves them.
#[derive(Clone)]
pub struct IrohTransport {
    endpoint: Endpoint,
    addrs: Arc<DashMap<PeerId, EndpointAddr>>,
    clients: Arc<DashMap<PeerId, IrpcClient<RaftProto>>>,
}

impl fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrohTransport")
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl IrohTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            addrs: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
        }
    }

    pub fn add_addr(&self, addr: EndpointAddr) {
        let peer = peer_id(&addr.id);
        self.clients.remove(&peer);
        self.addrs.insert(peer, addr);
    }

    fn client(&self, target: PeerId) -> Result<IrpcClient<RaftProto>, TransportError> {
        if let Some(client) = self.clients.get(&target) {
            return Ok(client.clone());
        }
        let addr = match self.addrs.get(&target) {
            Some(addr) => addr.clone(),
            None => EndpointAddr::from(
                endpoint_id(&target).map_err(|_| TransportError::Unreachable(target))?,
            ),
        };
        let conn = IrohRemoteConnection::new(self.endpoint.clone(), addr, RAFT_ALPN.to_vec());
        let client = IrpcClient::boxed(conn);
        self.clients.insert(target, client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl Transport for IrohTransport {
    async fn send(
        &self,
        target: PeerId,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        let client = self.client(target)?;
        let result = match request {
            RaftRequest::Vote(req) => client.rpc(req).await,
            RaftRequest::Append(req) => client.rpc(req).await,
            RaftRequest::InstallSnapshot(req) => client.rpc(req).await,
        };
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(TransportError::Remote(err.to_string())),
            Err(err) => {
                debug!(peer = %target.fmt_short(), "raft rpc failed: {err}");
                // Redial on the next attempt.
                self.clients.remove(&target);
                Err(TransportError::Unreachable(target))
            }
        }
    }
}
