use crate::API_ALPN;
use anyhow::Result;
use iroh::{
    EndpointAddr,
    endpoint::{Connection, Endpoint},
    protocol::{AcceptError, ProtocolHandler},
};
use irpc::{Client as IrpcClient, channel::oneshot, rpc_requests};
use irpc_iroh::{IrohRemoteConnection, read_request};
use pinset_consensus::{ConsensusError, Raft, RaftStatus};
use pinset_core::{Cid, EntryId, PeerId, PinSerial, ReplicationFactor};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Error returned to API clients.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiError {
    /// Writes go to the leader; `leader` is where to retry, if known.
    #[error("not the leader (leader: {})", .leader.map(|l| l.to_string()).unwrap_or_else(|| "unknown".into()))]
    NotLeader { leader: Option<PeerId> },
    #[error("request timed out")]
    Timeout,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl From<ConsensusError> for ApiError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader { leader } => ApiError::NotLeader { leader },
            ConsensusError::Timeout => ApiError::Timeout,
            ConsensusError::Apply(err) => ApiError::Malformed(err.to_string()),
            other => ApiError::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PinRequest {
    pub cid: String,
    pub replication_factor: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnpinRequest {
    pub cid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRequest;

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub cid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRequest;

#[derive(Debug, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub peer: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovePeerRequest {
    pub peer: PeerId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotNowRequest;

#[derive(Debug, Serialize, Deserialize)]
#[rpc_requests(message = ApiRpcMessage)]
pub enum ApiProto {
    #[rpc(tx = oneshot::Sender<Result<u64, ApiError>>)]
    Pin(PinRequest),
    #[rpc(tx = oneshot::Sender<Result<u64, ApiError>>)]
    Unpin(UnpinRequest),
    #[rpc(tx = oneshot::Sender<Vec<PinSerial>>)]
    List(ListRequest),
    #[rpc(tx = oneshot::Sender<Result<Option<PinSerial>, ApiError>>)]
    Get(GetRequest),
    #[rpc(tx = oneshot::Sender<RaftStatus>)]
    Status(StatusRequest),
    #[rpc(tx = oneshot::Sender<Result<u64, ApiError>>)]
    AddPeer(AddPeerRequest),
    #[rpc(tx = oneshot::Sender<Result<u64, ApiError>>)]
    RemovePeer(RemovePeerRequest),
    #[rpc(tx = oneshot::Sender<Result<EntryId, ApiError>>)]
    Snapshot(SnapshotNowRequest),
}

/// Serves the client API of a local replica over iroh.
///
/// Writes are only accepted by the leader; followers answer them with
/// [`ApiError::NotLeader`]. Reads are served from the local state.
#[derive(Clone)]
pub struct ApiServer {
    raft: Raft,
}

impl fmt::Debug for ApiServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiServer")
            .field("peer", &self.raft.id())
            .finish()
    }
}

fn parse_cid(cid: &str) -> Result<Cid, ApiError> {
    Cid::parse(cid).map_err(|err| ApiError::Malformed(format!("invalid cid {cid:?}: {err}")))
}

impl ApiServer {
    pub fn new(raft: Raft) -> Self {
        Self { raft }
    }

    async fn handle_pin(&self, req: PinRequest) -> Result<u64, ApiError> {
        let cid = parse_cid(&req.cid)?;
        let replication_factor = ReplicationFactor::new(req.replication_factor)
            .map_err(|err| ApiError::Malformed(err.to_string()))?;
        let index = self.raft.submit_pin(&cid, replication_factor).await?;
        info!(cid = %cid, index, "pinned");
        Ok(index)
    }

    async fn handle_unpin(&self, req: UnpinRequest) -> Result<u64, ApiError> {
        let cid = parse_cid(&req.cid)?;
        let index = self.raft.submit_unpin(&cid).await?;
        info!(cid = %cid, index, "unpinned");
        Ok(index)
    }

    fn handle_get(&self, req: GetRequest) -> Result<Option<PinSerial>, ApiError> {
        let cid = parse_cid(&req.cid)?;
        Ok(self.raft.get_pin(&cid).map(|pin| pin.to_serial()))
    }
}

impl ProtocolHandler for ApiServer {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        while let Some(msg) = read_request::<ApiProto>(&conn).await? {
            match msg {
                ApiRpcMessage::Pin(irpc::WithChannels { inner, tx, .. }) => {
                    let result = self.handle_pin(inner).await;
                    let _ = tx.send(result).await;
                }
                ApiRpcMessage::Unpin(irpc::WithChannels { inner, tx, .. }) => {
                    let result = self.handle_unpin(inner).await;
                    let _ = tx.send(result).await;
                }
                ApiRpcMessage::List(irpc::WithChannels { tx, .. }) => {
                    let pins = self.raft.list_pins().iter().map(|p| p.to_serial()).collect();
                    let _ = tx.send(pins).await;
                }
                ApiRpcMessage::Get(irpc::WithChannels { inner, tx, .. }) => {
                    let _ = tx.send(self.handle_get(inner)).await;
                }
                ApiRpcMessage::Status(irpc::WithChannels { tx, .. }) => {
                    let _ = tx.send(self.raft.status()).await;
                }
                ApiRpcMessage::AddPeer(irpc::WithChannels { inner, tx, .. }) => {
                    debug!(peer = %inner.peer.fmt_short(), "add peer requested");
                    let result = self.raft.add_peer(inner.peer).await.map_err(ApiError::from);
                    let _ = tx.send(result).await;
                }
                ApiRpcMessage::RemovePeer(irpc::WithChannels { inner, tx, .. }) => {
                    debug!(peer = %inner.peer.fmt_short(), "remove peer requested");
                    let result = self
                        .raft
                        .remove_peer(inner.peer)
                        .await
                        .map_err(ApiError::from);
                    let _ = tx.send(result).await;
                }
                ApiRpcMessage::Snapshot(irpc::WithChannels { tx, .. }) => {
                    let result = self.raft.trigger_snapshot().await.map_err(ApiError::from);
                    let _ = tx.send(result).await;
                }
            }
        }
        conn.closed().await;
        Ok(())
    }
}

/// RPC client for the pinset client API.
///
/// Remote failures come back as an [`ApiError`] inside the
/// `anyhow::Error`, so callers can downcast to find a leader hint.
#[derive(Clone, Debug)]
pub struct ApiClient {
    inner: IrpcClient<ApiProto>,
}

impl ApiClient {
    pub fn connect(endpoint: Endpoint, addr: impl Into<EndpointAddr>) -> Self {
        let conn = IrohRemoteConnection::new(endpoint, addr.into(), API_ALPN.to_vec());
        ApiClient {
            inner: IrpcClient::boxed(conn),
        }
    }

    pub async fn pin(&self, cid: &Cid, replication_factor: ReplicationFactor) -> Result<u64> {
        let req = PinRequest {
            cid: cid.to_string(),
            replication_factor: replication_factor.get(),
        };
        Ok(self.inner.rpc(req).await??)
    }

    pub async fn unpin(&self, cid: &Cid) -> Result<u64> {
        let req = UnpinRequest {
            cid: cid.to_string(),
        };
        Ok(self.inner.rpc(req).await??)
    }

    pub async fn list(&self) -> Result<Vec<PinSerial>> {
        Ok(self.inner.rpc(ListRequest).await?)
    }

    pub async fn get(&self, cid: &Cid) -> Result<Option<PinSerial>> {
        let req = GetRequest {
            cid: cid.to_string(),
        };
        Ok(self.inner.rpc(req).await??)
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        Ok(self.inner.rpc(StatusRequest).await?)
    }

    pub async fn add_peer(&self, peer: PeerId) -> Result<u64> {
        Ok(self.inner.rpc(AddPeerRequest { peer }).await??)
    }

    pub async fn remove_peer(&self, peer: PeerId) -> Result<u64> {
        Ok(self.inner.rpc(RemovePeerRequest { peer }).await??)
    }

    pub async fn snapshot(&self) -> Result<EntryId> {
        Ok(self.inner.rpc(SnapshotNowRequest).await??)
    }
}
