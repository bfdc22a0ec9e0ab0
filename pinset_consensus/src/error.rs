use crate::config::ConfigError;
use openraft::EmptyNode;
use openraft::error::{
    ChangeMembershipError, ClientWriteError, Fatal, InitializeError, InstallSnapshotError,
    RaftError,
};
use pinset_core::{ApplyError, PeerId};
use serde::{Deserialize, Serialize};

/// Why a consensus operation failed.
///
/// Cloneable and serializable so that it can be returned to remote callers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusError {
    #[error("not the leader (leader: {})", .leader.map(|l| l.fmt_short()).unwrap_or_else(|| "unknown".into()))]
    NotLeader { leader: Option<PeerId> },
    #[error("timed out waiting for commit")]
    Timeout,
    #[error("no leader could be reached")]
    NoQuorum,
    #[error("a membership change is already in progress")]
    MembershipChangeInProgress,
    #[error("replica is shutting down")]
    ShuttingDown,
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("snapshot failure: {0}")]
    Snapshot(String),
    #[error("replica stopped after a fatal error: {0}")]
    Stopped(String),
    #[error("committed entry failed to apply: {0}")]
    Apply(#[from] ApplyError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConsensusError {
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        ConsensusError::Storage(format!("{err:#}"))
    }

    /// Transient conditions a caller may retry, possibly at another peer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsensusError::NotLeader { .. }
                | ConsensusError::Timeout
                | ConsensusError::NoQuorum
                | ConsensusError::MembershipChangeInProgress
        )
    }

    /// Errors that stop the local replica.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::Storage(_) | ConsensusError::Snapshot(_))
    }
}

impl ConsensusError {
    /// Maps the reason openraft stopped. A regular shutdown is not a failure.
    pub(crate) fn from_fatal(fatal: &Fatal<PeerId>) -> Self {
        match fatal {
            Fatal::Stopped => ConsensusError::ShuttingDown,
            Fatal::StorageError(err) => ConsensusError::Storage(err.to_string()),
            other => ConsensusError::Stopped(other.to_string()),
        }
    }
}

impl<E> From<RaftError<PeerId, E>> for ConsensusError
where
    E: std::error::Error + Into<ConsensusError>,
{
    fn from(err: RaftError<PeerId, E>) -> Self {
        match err {
            RaftError::APIError(err) => err.into(),
            RaftError::Fatal(fatal) => ConsensusError::from_fatal(&fatal),
        }
    }
}

impl From<ClientWriteError<PeerId, EmptyNode>> for ConsensusError {
    fn from(err: ClientWriteError<PeerId, EmptyNode>) -> Self {
        match err {
            ClientWriteError::ForwardToLeader(forward) => ConsensusError::NotLeader {
                leader: forward.leader_id,
            },
            ClientWriteError::ChangeMembershipError(ChangeMembershipError::InProgress(_)) => {
                ConsensusError::MembershipChangeInProgress
            }
            ClientWriteError::ChangeMembershipError(err) => ConsensusError::Config(err.to_string()),
        }
    }
}

impl From<InitializeError<PeerId, EmptyNode>> for ConsensusError {
    fn from(err: InitializeError<PeerId, EmptyNode>) -> Self {
        ConsensusError::Config(err.to_string())
    }
}

impl From<InstallSnapshotError> for ConsensusError {
    fn from(err: InstallSnapshotError) -> Self {
        ConsensusError::Snapshot(err.to_string())
    }
}

impl From<openraft::error::Infallible> for ConsensusError {
    fn from(err: openraft::error::Infallible) -> Self {
        match err {}
    }
}

impl From<ConfigError> for ConsensusError {
    fn from(err: ConfigError) -> Self {
        ConsensusError::Config(err.to_string())
    }
}
