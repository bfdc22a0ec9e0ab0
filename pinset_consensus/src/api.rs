//! The handle through which a node drives its replica of the pin log.

use crate::{
    applier::{self, ApplyCounters, Applier, SharedState},
    config::RaftConfig,
    error::ConsensusError,
    message::{RaftRequest, RaftResponse},
    snapshot,
    storage::LogStorage,
    transport::{Network, Transport},
    types::{self, TypeConfig},
};
use openraft::error::{Fatal, InitializeError, RaftError};
use openraft::{ChangeMembers, EmptyNode, RaftMetrics, ServerState};
use pinset_core::{
    Cid, EntryId, LogOp, LogStore, Membership, PeerId, Pin, PinState, ReplicationFactor,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

type Metrics = RaftMetrics<PeerId, EmptyNode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Replicates the log without a vote, or has not joined a cluster yet.
    Learner,
    Follower,
    Candidate,
    Leader,
    /// Shut down, or halted by a fatal error.
    Stopped,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Learner => "learner",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: PeerId,
    pub role: Role,
    pub term: u64,
    pub leader: Option<PeerId>,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    /// Voters, sorted.
    pub members: Vec<PeerId>,
    pub learners: Vec<PeerId>,
    /// Committed operations applied successfully.
    pub applied: u64,
    /// Committed operations that failed to apply.
    pub failed: u64,
    /// Set once the replica halted on a storage or snapshot failure.
    pub fatal: Option<String>,
}

impl RaftStatus {
    fn new(id: PeerId, metrics: &Metrics, counters: &ApplyCounters, stopping: bool) -> Self {
        let fatal = match &metrics.running_state {
            Ok(()) | Err(Fatal::Stopped) => None,
            Err(fatal) => Some(fatal.to_string()),
        };
        let role = if stopping || metrics.running_state.is_err() {
            Role::Stopped
        } else {
            match metrics.state {
                ServerState::Learner => Role::Learner,
                ServerState::Follower => Role::Follower,
                ServerState::Candidate => Role::Candidate,
                ServerState::Leader => Role::Leader,
                ServerState::Shutdown => Role::Stopped,
            }
        };
        let membership = types::membership(metrics.membership_config.membership());
        Self {
            id,
            role,
            term: metrics.current_term,
            leader: if role == Role::Stopped {
                None
            } else {
                metrics.current_leader
            },
            last_applied: metrics.last_applied.map_or(0, |id| id.index),
            last_log_index: metrics.last_log_index.unwrap_or(0),
            snapshot_index: metrics.snapshot.map_or(0, |id| id.index),
            members: membership.voters().into_iter().collect(),
            learners: membership.learners().into_iter().collect(),
            applied: counters.applied(),
            failed: counters.failed(),
            fatal,
        }
    }
}

/// A cheap, cloneable handle to a running replica.
///
/// Election, replication and compaction run inside openraft; the handle
/// adds deadlines to client calls and folds openraft's metrics and the
/// applier's counters into a [`RaftStatus`].
///
/// The pin state is only changed by applying committed entries. The handle
/// offers reads, never a writable state:
///
/// ```compile_fail
/// fn mutate(raft: &pinset_consensus::Raft) {
///     let _ = raft.state().write();
/// }
/// ```
#[derive(Clone)]
pub struct Raft {
    id: PeerId,
    config: Arc<RaftConfig>,
    raft: openraft::Raft<TypeConfig>,
    state: SharedState,
    counters: Arc<ApplyCounters>,
    stopping: Arc<AtomicBool>,
    status: watch::Receiver<RaftStatus>,
}

impl std::fmt::Debug for Raft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raft").field("id", &self.id).finish()
    }
}

impl Raft {
    /// Starts a replica backed by `store`, applying committed operations to
    /// `state`.
    ///
    /// `bootstrap` is only used when the store is empty: it becomes the
    /// initial membership. Peers joining an existing cluster pass `None`
    /// and wait to be added by the leader.
    ///
    /// The stored snapshot and every committed entry after it are applied
    /// before this returns.
    pub async fn start<S: PinState>(
        id: PeerId,
        config: RaftConfig,
        bootstrap: Option<Membership>,
        store: Arc<dyn LogStore>,
        transport: Arc<dyn Transport>,
        state: S,
    ) -> Result<Self, ConsensusError> {
        let raft_config = Arc::new(config.to_openraft()?);
        let config = Arc::new(config);

        let mut applier = Applier::new(state, store.clone());
        applier.load().await?;
        let shared = applier.state();
        let counters = applier.counters();

        let network = Network::new(transport, config.rpc_timeout());
        let raft = openraft::Raft::new(id, raft_config, network, LogStorage::new(store), applier)
            .await
            .map_err(|fatal| ConsensusError::from_fatal(&fatal))?;

        if let Some(membership) = bootstrap {
            match raft.initialize(membership.voters()).await {
                Ok(()) => tracing::info!(
                    peer = %id.fmt_short(),
                    voters = membership.voters().len(),
                    "bootstrapped cluster"
                ),
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    tracing::debug!(peer = %id.fmt_short(), "log exists, skipping bootstrap");
                }
                Err(err) => {
                    let _ = raft.shutdown().await;
                    return Err(err.into());
                }
            }
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let initial = RaftStatus::new(id, &raft.metrics().borrow(), &counters, false);
        let (status_tx, status) = watch::channel(initial);
        tokio::spawn(forward_status(
            id,
            raft.metrics(),
            counters.clone(),
            stopping.clone(),
            status_tx,
        ));

        Ok(Self {
            id,
            config,
            raft,
            state: shared,
            counters,
            stopping,
            status,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Fails fast once the replica stopped, before any work is queued.
    fn ensure_running(&self) -> Result<(), ConsensusError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ConsensusError::ShuttingDown);
        }
        match &self.raft.metrics().borrow().running_state {
            Ok(()) => Ok(()),
            Err(Fatal::Stopped) => Err(ConsensusError::ShuttingDown),
            Err(fatal) => Err(ConsensusError::Stopped(fatal.to_string())),
        }
    }

    /// Runs `call` under the submit deadline. Calls cut short by
    /// [`shutdown`](Self::shutdown) report [`ConsensusError::ShuttingDown`].
    async fn deadline<T>(
        &self,
        call: impl Future<Output = Result<T, ConsensusError>>,
    ) -> Result<T, ConsensusError> {
        let result = match tokio::time::timeout(self.config.submit_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::Timeout),
        };
        if result.is_err() && self.stopping.load(Ordering::SeqCst) {
            return Err(ConsensusError::ShuttingDown);
        }
        result
    }

    /// Replicates `op` and returns its log index once it is committed and
    /// applied locally.
    ///
    /// Fails with [`ConsensusError::NotLeader`] on followers and with
    /// [`ConsensusError::Apply`] if the committed operation could not be
    /// applied; the entry stays in the log either way.
    pub async fn submit(&self, op: LogOp) -> Result<u64, ConsensusError> {
        self.ensure_running()?;
        self.deadline(async {
            let response = self.raft.client_write(op).await?;
            response.data?;
            Ok(response.log_id.index)
        })
        .await
    }

    pub async fn submit_pin(
        &self,
        cid: &Cid,
        replication_factor: ReplicationFactor,
    ) -> Result<u64, ConsensusError> {
        self.submit(LogOp::pin(&Pin::new(cid.clone(), replication_factor)))
            .await
    }

    pub async fn submit_unpin(&self, cid: &Cid) -> Result<u64, ConsensusError> {
        self.submit(LogOp::unpin(cid)).await
    }

    /// Pins in the local state, sorted by CID.
    ///
    /// Reads are local and may trail the leader.
    pub fn list_pins(&self) -> Vec<Pin> {
        applier::list(&self.state)
    }

    pub fn get_pin(&self, cid: &Cid) -> Option<Pin> {
        applier::get(&self.state, cid)
    }

    pub fn has_pin(&self, cid: &Cid) -> bool {
        self.get_pin(cid).is_some()
    }

    fn membership(&self) -> (Membership, u64) {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let stored = &metrics.membership_config;
        (
            types::membership(stored.membership()),
            stored.log_id().map_or(0, |id| id.index),
        )
    }

    /// Adds a voter. Returns the index of the membership entry.
    ///
    /// The peer first joins as a learner, then becomes a voter through a
    /// joint configuration. Adding a current voter changes nothing.
    pub async fn add_peer(&self, peer: PeerId) -> Result<u64, ConsensusError> {
        self.ensure_running()?;
        let (membership, index) = self.membership();
        if membership.is_voter(&peer) {
            return Ok(index);
        }
        self.deadline(async {
            self.raft
                .add_learner(peer, EmptyNode::default(), false)
                .await?;
            let response = self
                .raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([peer])), false)
                .await?;
            tracing::info!(peer = %peer.fmt_short(), index = response.log_id.index, "added voter");
            Ok(response.log_id.index)
        })
        .await
    }

    /// Removes a voter, possibly this replica itself.
    pub async fn remove_peer(&self, peer: PeerId) -> Result<u64, ConsensusError> {
        self.ensure_running()?;
        let (membership, index) = self.membership();
        if !membership.is_voter(&peer) {
            return Ok(index);
        }
        if membership.voters().len() == 1 {
            return Err(ConsensusError::Config(format!(
                "cannot remove {}, the last voter",
                peer.fmt_short()
            )));
        }
        self.deadline(async {
            let response = self
                .raft
                .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([peer])), false)
                .await?;
            tracing::info!(peer = %peer.fmt_short(), index = response.log_id.index, "removed voter");
            Ok(response.log_id.index)
        })
        .await
    }

    /// Snapshots the applied state now and compacts the log.
    ///
    /// Returns the last entry the snapshot covers. With nothing applied
    /// since the last snapshot this is a no-op.
    pub async fn trigger_snapshot(&self) -> Result<EntryId, ConsensusError> {
        self.ensure_running()?;
        let mut metrics = self.raft.metrics();
        let target = {
            let current = metrics.borrow_and_update();
            match current.last_applied {
                None => return Err(ConsensusError::Snapshot("nothing applied yet".into())),
                Some(applied) if current.snapshot == Some(applied) => {
                    return Ok(types::entry_id(&applied));
                }
                Some(applied) => applied.index,
            }
        };
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|fatal| ConsensusError::from_fatal(&fatal))?;
        let snapshot = self
            .deadline(async {
                let current = metrics
                    .wait_for(|m| {
                        m.running_state.is_err() || m.snapshot.is_some_and(|s| s.index >= target)
                    })
                    .await
                    .map_err(|_| ConsensusError::ShuttingDown)?;
                if let Err(fatal) = &current.running_state {
                    return Err(ConsensusError::from_fatal(fatal));
                }
                current
                    .snapshot
                    .ok_or_else(|| ConsensusError::Snapshot("snapshot vanished".into()))
            })
            .await?;
        Ok(types::entry_id(&snapshot))
    }

    pub fn status(&self) -> RaftStatus {
        let metrics = self.raft.metrics();
        let current = metrics.borrow();
        RaftStatus::new(
            self.id,
            &current,
            &self.counters,
            self.stopping.load(Ordering::SeqCst),
        )
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Waits until some replica is known to lead.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<PeerId, ConsensusError> {
        self.ensure_running()?;
        let mut metrics = self.raft.metrics();
        let wait = async {
            let current = metrics
                .wait_for(|m| m.running_state.is_err() || m.current_leader.is_some())
                .await
                .map_err(|_| ConsensusError::ShuttingDown)?;
            match (&current.running_state, current.current_leader) {
                (Err(Fatal::Stopped), _) => Err(ConsensusError::ShuttingDown),
                (Err(fatal), _) => Err(ConsensusError::Stopped(fatal.to_string())),
                (Ok(()), Some(leader)) => Ok(leader),
                (Ok(()), None) => Err(ConsensusError::NoQuorum),
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::NoQuorum),
        }
    }

    /// Processes a protocol message received from another peer.
    ///
    /// Snapshot data is checked before openraft sees it: a damaged snapshot
    /// is refused with [`ConsensusError::Snapshot`] and the replica keeps
    /// its state, so the leader retries instead of counting it installed.
    pub async fn handle_request(&self, request: RaftRequest) -> Result<RaftResponse, ConsensusError> {
        self.ensure_running()?;
        let response = match request {
            RaftRequest::Vote(req) => RaftResponse::Vote(self.raft.vote(req).await?),
            RaftRequest::Append(req) => RaftResponse::Append(self.raft.append_entries(req).await?),
            RaftRequest::InstallSnapshot(req) => {
                if req.offset == 0 && req.done {
                    snapshot::unseal(&req.data).map_err(|e| {
                        tracing::warn!(snapshot = %req.meta.snapshot_id, "refusing snapshot: {e}");
                        ConsensusError::Snapshot(format!("snapshot {}: {e}", req.meta.snapshot_id))
                    })?;
                }
                let response = self.raft.install_snapshot(req).await?;
                // Installation failures stop the replica rather than erroring.
                self.ensure_running()?;
                RaftResponse::InstallSnapshot(response)
            }
        };
        Ok(response)
    }

    /// Stops the replica after applying what is already committed.
    /// Pending submissions fail with [`ConsensusError::ShuttingDown`].
    pub async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = self.raft.shutdown().await {
            tracing::warn!(peer = %self.id.fmt_short(), "raft core did not stop cleanly: {err}");
        }
    }
}

/// Republishes openraft's metrics as [`RaftStatus`] until the replica
/// stops or nobody listens.
async fn forward_status(
    id: PeerId,
    mut metrics: watch::Receiver<Metrics>,
    counters: Arc<ApplyCounters>,
    stopping: Arc<AtomicBool>,
    status: watch::Sender<RaftStatus>,
) {
    loop {
        let next = RaftStatus::new(
            id,
            &metrics.borrow_and_update(),
            &counters,
            stopping.load(Ordering::SeqCst),
        );
        status.send_replace(next);
        tokio::select! {
            changed = metrics.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = status.closed() => return,
        }
    }
    status.send_modify(|s| {
        s.role = Role::Stopped;
        s.leader = None;
    });
}
