//! Wiring of a pinset node: identity, durable log, Raft and the iroh
//! protocols that expose it.

use crate::config::PinsetNodeConfig;
use anyhow::{Context, Result};
use iroh::{Endpoint, EndpointAddr, EndpointId, protocol::Router};
use pinset_consensus::Raft;
use pinset_core::{MapState, Membership, PeerId};
use pinset_logstore_redb::RedbLogStore;
use pinset_net::{API_ALPN, ApiServer, IrohTransport, RAFT_ALPN, RaftServer, peer_id};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod config;
pub mod identity;

/// How long `shutdown` waits for the Raft actor to close the log store.
const STORE_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// A running replica together with the router serving it.
#[derive(Debug)]
pub struct PinsetNode {
    raft: Raft,
    router: Router,
    store: Arc<RedbLogStore>,
}

impl PinsetNode {
    /// Starts a node from `config`. Relative paths in the config are
    /// resolved against `config_dir`.
    pub async fn start(config: PinsetNodeConfig, config_dir: Option<&Path>) -> Result<Self> {
        let secret_key = identity::load_secret_key(&config.identity, config_dir)?;
        let endpoint = Endpoint::builder().secret_key(secret_key).bind().await?;
        let id = peer_id(&endpoint.id());

        let storage = identity::resolve_path(&config.storage.path, config_dir);
        let store = Arc::new(
            RedbLogStore::open(&storage)
                .with_context(|| format!("failed to open log store at {}", storage.display()))?,
        );

        let transport = IrohTransport::new(endpoint.clone());
        let mut members = vec![id];
        for (name, value) in &config.cluster.peers {
            let endpoint_id = EndpointId::from_str(value)
                .with_context(|| format!("invalid endpoint id for peer '{name}': '{value}'"))?;
            transport.add_addr(EndpointAddr::from(endpoint_id));
            members.push(peer_id(&endpoint_id));
        }
        let bootstrap = config.cluster.bootstrap.then(|| Membership::new(members));

        let raft = Raft::start(
            id,
            config.raft,
            bootstrap,
            store.clone(),
            Arc::new(transport),
            MapState::new(),
        )
        .await?;

        let router = Router::builder(endpoint)
            .accept(RAFT_ALPN, RaftServer::new(raft.clone()))
            .accept(API_ALPN, ApiServer::new(raft.clone()))
            .spawn();

        info!(peer = %id, storage = %storage.display(), "pinset node started");
        Ok(Self {
            raft,
            router,
            store,
        })
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.router.endpoint()
    }

    pub fn peer_id(&self) -> PeerId {
        self.raft.id()
    }

    /// Stops Raft, closes the endpoint and waits until the log store is
    /// released so the same storage can be opened again.
    pub async fn shutdown(self) -> Result<()> {
        self.raft.shutdown().await;
        self.router.shutdown().await?;
        drop(self.raft);
        let released = tokio::time::timeout(STORE_RELEASE_TIMEOUT, async {
            while Arc::strong_count(&self.store) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if released.is_err() {
            warn!("log store still in use after shutdown");
        }
        Ok(())
    }
}

pub async fn run_node(config_file_path: PathBuf, config: PinsetNodeConfig) -> Result<()> {
    let node = PinsetNode::start(config, config_file_path.parent()).await?;
    println!("{}", node.peer_id());

    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    node.shutdown().await
}
