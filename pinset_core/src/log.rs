//! Replicated log records and the durable store they are written to.

use crate::op::LogOp;
use crate::peer::PeerId;
use anyhow::Result;
use bytes::Bytes;
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Position of an entry in the log, together with the leader that
/// proposed it.
///
/// Ordering compares `term` first, then the leader, then the index.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
#[cbor(array)]
pub struct EntryId {
    #[n(0)]
    pub term: u64,
    #[n(1)]
    pub leader: PeerId,
    #[n(2)]
    pub index: u64,
}

impl EntryId {
    pub fn new(term: u64, leader: PeerId, index: u64) -> Self {
        Self {
            term,
            leader,
            index,
        }
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// Members of the consensus group.
///
/// `configs` holds one voter set, or two while a joint change is in
/// flight. `nodes` lists every member, voters and learners alike.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Membership {
    #[n(0)]
    pub configs: Vec<BTreeSet<PeerId>>,
    #[n(1)]
    pub nodes: BTreeSet<PeerId>,
}

impl Membership {
    /// A uniform configuration in which every peer votes.
    pub fn new(voters: impl IntoIterator<Item = PeerId>) -> Self {
        let voters: BTreeSet<PeerId> = voters.into_iter().collect();
        Self {
            nodes: voters.clone(),
            configs: vec![voters],
        }
    }

    /// Peers with a vote in any of the configurations.
    pub fn voters(&self) -> BTreeSet<PeerId> {
        self.configs.iter().flatten().copied().collect()
    }

    /// Members that replicate the log without voting.
    pub fn learners(&self) -> BTreeSet<PeerId> {
        let voters = self.voters();
        self.nodes.difference(&voters).copied().collect()
    }

    pub fn is_voter(&self, peer: &PeerId) -> bool {
        self.configs.iter().any(|c| c.contains(peer))
    }

    pub fn is_joint(&self) -> bool {
        self.configs.len() > 1
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from earlier terms.
    #[n(0)]
    Blank,
    #[n(1)]
    Op(#[n(0)] LogOp),
    /// A configuration change; effective as soon as it is appended.
    #[n(2)]
    Membership(#[n(0)] Membership),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogEntry {
    #[n(0)]
    pub id: EntryId,
    #[n(1)]
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(id: EntryId, payload: EntryPayload) -> Self {
        Self { id, payload }
    }

    pub fn index(&self) -> u64 {
        self.id.index
    }

    pub fn term(&self) -> u64 {
        self.id.term
    }
}

/// Consensus state that must survive restarts: the last vote and the
/// highest entry known to be committed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct HardState {
    #[n(0)]
    pub term: u64,
    /// Candidate voted for in `term`, or the leader once `vote_committed`.
    #[n(1)]
    pub voted_for: PeerId,
    /// Set once a quorum granted the vote.
    #[n(2)]
    pub vote_committed: bool,
    #[n(3)]
    pub committed: Option<EntryId>,
}

/// Describes the log prefix a snapshot replaces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SnapshotMeta {
    #[n(0)]
    pub last_included: Option<EntryId>,
    /// Entry that introduced `membership`.
    #[n(1)]
    pub membership_id: Option<EntryId>,
    #[n(2)]
    pub membership: Membership,
    #[n(3)]
    pub snapshot_id: String,
}

/// Durable append-only log with snapshot support.
///
/// Indexes are contiguous. An empty store accepts any first index; after
/// that every append continues the log, or the purged prefix when the log
/// was emptied by compaction.
///
/// Any error is treated as fatal by the consensus engine.
#[async_trait::async_trait]
pub trait LogStore: std::fmt::Debug + Send + Sync + 'static {
    /// Appends entries that must directly follow the current last entry.
    ///
    /// Returns the index of the last entry in the log afterwards.
    async fn append(&self, entries: Vec<LogEntry>) -> Result<u64>;

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>>;

    /// Entries in `from..to`. Missing entries end the range early.
    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>>;

    /// Id of the last entry still in the log; falls back to
    /// [`last_purged`](Self::last_purged) once compaction emptied it.
    async fn last_entry_id(&self) -> Result<Option<EntryId>>;

    /// Id of the last entry removed by [`truncate_prefix`](Self::truncate_prefix).
    async fn last_purged(&self) -> Result<Option<EntryId>>;

    /// Removes all entries with index `>= from`.
    async fn truncate_suffix(&self, from: u64) -> Result<()>;

    /// Removes all entries up to and including `upto` and remembers it as
    /// the last purged id.
    async fn truncate_prefix(&self, upto: EntryId) -> Result<()>;

    /// Replaces the stored snapshot. Does not touch the log.
    async fn write_snapshot(&self, data: Bytes, meta: SnapshotMeta) -> Result<()>;

    async fn read_snapshot(&self) -> Result<Option<(Bytes, SnapshotMeta)>>;

    async fn save_hard_state(&self, state: HardState) -> Result<()>;

    /// `None` for a store that has never been written to.
    async fn hard_state(&self) -> Result<Option<HardState>>;
}
