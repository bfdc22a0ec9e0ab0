#![allow(dead_code)]

use anyhow::{Result, bail};
use pinset_consensus::{Raft, RaftConfig, Role, SimNetwork};
use pinset_core::{Cid, LogStore, MapState, Membership, PeerId, cid::CODEC_RAW};
use pinset_logstore_memory::MemoryLogStore;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn peer(n: u8) -> PeerId {
    PeerId([n; 32])
}

pub fn test_cid(n: u32) -> Cid {
    Cid::blake3(CODEC_RAW, n.to_be_bytes())
}

/// Timings tight enough for tests, loose enough for a loaded CI box.
pub fn test_config() -> RaftConfig {
    RaftConfig {
        heartbeat_interval_ms: 20,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        rpc_timeout_ms: 100,
        submit_timeout_ms: 5000,
        snapshot_threshold: 10_000,
        max_entries_per_append: 64,
    }
}

/// Replicas wired together through a [`SimNetwork`].
pub struct Cluster {
    pub net: SimNetwork,
    pub config: RaftConfig,
    pub members: Membership,
}

impl Cluster {
    /// Starts `n` replicas on in-memory stores, all founding members.
    pub async fn start(n: u8) -> Result<Self> {
        Self::start_with(n, test_config()).await
    }

    pub async fn start_with(n: u8, config: RaftConfig) -> Result<Self> {
        let members = Membership::new((1..=n).map(peer));
        let cluster = Self {
            net: SimNetwork::new(),
            config,
            members,
        };
        for id in cluster.members.voters() {
            cluster
                .start_peer(id, Some(cluster.members.clone()), Arc::new(MemoryLogStore::new()))
                .await?;
        }
        Ok(cluster)
    }

    pub async fn start_peer(
        &self,
        id: PeerId,
        bootstrap: Option<Membership>,
        store: Arc<dyn LogStore>,
    ) -> Result<Raft> {
        let raft = Raft::start(
            id,
            self.config.clone(),
            bootstrap,
            store,
            self.net.transport(id),
            MapState::new(),
        )
        .await?;
        self.net.register(raft.clone());
        Ok(raft)
    }

    pub fn raft(&self, id: PeerId) -> Raft {
        self.net
            .get(&id)
            .unwrap_or_else(|| panic!("peer {id} is not registered"))
    }

    /// Stops a replica and takes it off the network.
    pub async fn kill(&self, id: PeerId) {
        if let Some(raft) = self.net.unregister(&id) {
            raft.shutdown().await;
        }
    }

    /// Waits until exactly one of `among` leads and the others agree on it.
    pub async fn wait_for_leader(&self, among: &[PeerId]) -> Result<Raft> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let statuses: Vec<_> = among
                .iter()
                .filter_map(|id| self.net.get(id))
                .map(|r| r.status())
                .collect();
            let leaders: Vec<_> = statuses.iter().filter(|s| s.role == Role::Leader).collect();
            if let [leader] = leaders.as_slice() {
                let agreed = statuses
                    .iter()
                    .filter(|s| s.leader == Some(leader.id))
                    .count();
                if agreed == statuses.len() {
                    return Ok(self.raft(leader.id));
                }
            }
            if tokio::time::Instant::now() > deadline {
                bail!("no stable leader among {} peers: {statuses:#?}", among.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until every peer in `peers` applied up to `index`.
    pub async fn wait_applied(&self, peers: &[PeerId], index: u64) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let lagging: Vec<_> = peers
                .iter()
                .filter(|id| {
                    self.net
                        .get(id)
                        .is_none_or(|r| r.status().last_applied < index)
                })
                .collect();
            if lagging.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                bail!("{} peers did not apply index {index}", lagging.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.members.voters().into_iter().collect()
    }

    pub async fn shutdown(&self) {
        for id in self.ids() {
            self.kill(id).await;
        }
    }
}
