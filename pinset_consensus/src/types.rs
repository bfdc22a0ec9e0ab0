//! Binds the pin log into openraft and converts between openraft's records
//! and the ones a [`LogStore`](pinset_core::LogStore) persists.

use openraft::{CommittedLeaderId, EmptyNode, ErrorSubject, ErrorVerb, TokioRuntime};
use pinset_core::{
    ApplyError, EntryId, EntryPayload, HardState, LogEntry, LogOp, Membership, PeerId,
    SnapshotMeta,
};
use std::io::Cursor;

/// What applying one committed entry produced.
pub type ApplyResult = Result<(), ApplyError>;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = LogOp,
        R = ApplyResult,
        NodeId = PeerId,
        Node = EmptyNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type LogId = openraft::LogId<PeerId>;
pub type Vote = openraft::Vote<PeerId>;
pub type Entry = openraft::Entry<TypeConfig>;
pub type RaftMembership = openraft::Membership<PeerId, EmptyNode>;
pub type StoredMembership = openraft::StoredMembership<PeerId, EmptyNode>;
pub type RaftSnapshotMeta = openraft::SnapshotMeta<PeerId, EmptyNode>;
pub type StorageError = openraft::StorageError<PeerId>;

pub fn log_id(id: &EntryId) -> LogId {
    LogId::new(CommittedLeaderId::new(id.term, id.leader), id.index)
}

pub fn entry_id(log_id: &LogId) -> EntryId {
    EntryId::new(log_id.leader_id.term, log_id.leader_id.node_id, log_id.index)
}

pub fn raft_membership(membership: &Membership) -> RaftMembership {
    RaftMembership::new(membership.configs.clone(), membership.nodes.clone())
}

pub fn membership(membership: &RaftMembership) -> Membership {
    Membership {
        configs: membership.get_joint_config().clone(),
        nodes: membership.nodes().map(|(id, _)| *id).collect(),
    }
}

pub fn log_entry(entry: &Entry) -> LogEntry {
    let payload = match &entry.payload {
        openraft::EntryPayload::Blank => EntryPayload::Blank,
        openraft::EntryPayload::Normal(op) => EntryPayload::Op(op.clone()),
        openraft::EntryPayload::Membership(m) => EntryPayload::Membership(membership(m)),
    };
    LogEntry::new(entry_id(&entry.log_id), payload)
}

pub fn raft_entry(entry: LogEntry) -> Entry {
    let payload = match entry.payload {
        EntryPayload::Blank => openraft::EntryPayload::Blank,
        EntryPayload::Op(op) => openraft::EntryPayload::Normal(op),
        EntryPayload::Membership(m) => openraft::EntryPayload::Membership(raft_membership(&m)),
    };
    Entry {
        log_id: log_id(&entry.id),
        payload,
    }
}

pub fn vote(state: &HardState) -> Vote {
    if state.vote_committed {
        Vote::new_committed(state.term, state.voted_for)
    } else {
        Vote::new(state.term, state.voted_for)
    }
}

/// Overwrites the vote part of `state`.
pub fn set_vote(state: &mut HardState, vote: &Vote) {
    state.term = vote.leader_id.term;
    state.voted_for = vote.leader_id.node_id;
    state.vote_committed = vote.committed;
}

pub fn snapshot_meta(meta: &RaftSnapshotMeta) -> SnapshotMeta {
    SnapshotMeta {
        last_included: meta.last_log_id.as_ref().map(entry_id),
        membership_id: meta.last_membership.log_id().as_ref().map(entry_id),
        membership: membership(meta.last_membership.membership()),
        snapshot_id: meta.snapshot_id.clone(),
    }
}

pub fn raft_snapshot_meta(meta: &SnapshotMeta) -> RaftSnapshotMeta {
    RaftSnapshotMeta {
        last_log_id: meta.last_included.as_ref().map(log_id),
        last_membership: StoredMembership::new(
            meta.membership_id.as_ref().map(log_id),
            raft_membership(&meta.membership),
        ),
        snapshot_id: meta.snapshot_id.clone(),
    }
}

/// Wraps a store failure for openraft, which stops the replica on any
/// storage error.
pub fn storage_error(
    subject: ErrorSubject<PeerId>,
    verb: ErrorVerb,
    err: impl std::fmt::Display,
) -> StorageError {
    StorageError::from_io_error(subject, verb, std::io::Error::other(format!("{err:#}")))
}
