//! Replicated pin/unpin operations.

use crate::cid::Cid;
use crate::pin::{Pin, PinError, PinSerial, ReplicationFactor};
use crate::state::{MapState, PinState};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::any::Any;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[cbor(index_only)]
pub enum LogOpKind {
    #[n(0)]
    Pin,
    #[n(1)]
    Unpin,
}

/// Outcome of applying a committed operation that could not be applied.
///
/// Every replica applying the same entry reaches the same error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyError {
    #[error("malformed cid {cid:?}: {reason}")]
    MalformedCid { cid: String, reason: String },
    #[error("invalid replication factor {0}")]
    InvalidReplicationFactor(i32),
    #[error("state handle does not implement the pin state capability set: {0}")]
    NonConformingState(String),
}

impl From<PinError> for ApplyError {
    fn from(err: PinError) -> Self {
        match err {
            PinError::Cid { cid, source } => ApplyError::MalformedCid {
                cid,
                reason: source.to_string(),
            },
            PinError::ReplicationFactor(rf) => ApplyError::InvalidReplicationFactor(rf),
        }
    }
}

/// A pin or unpin intent as stored in the replicated log.
///
/// The record carries no reference to the state it mutates; the consensus
/// engine binds it to the local state when the entry is committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogOp {
    #[n(0)]
    pub target: PinSerial,
    #[n(1)]
    pub kind: LogOpKind,
}

impl LogOp {
    pub fn new(target: PinSerial, kind: LogOpKind) -> Self {
        Self { target, kind }
    }

    pub fn pin(pin: &Pin) -> Self {
        Self::new(pin.to_serial(), LogOpKind::Pin)
    }

    pub fn unpin(cid: &Cid) -> Self {
        Self::new(
            PinSerial::new(cid.to_string(), ReplicationFactor::EVERYWHERE.get()),
            LogOpKind::Unpin,
        )
    }

    /// Applies the operation to a typed state.
    ///
    /// A target that does not decode fails before the state is touched.
    pub fn apply_to<S: PinState + ?Sized>(&self, state: &mut S) -> Result<(), ApplyError> {
        match self.kind {
            LogOpKind::Pin => {
                let pin = self.target.decode()?;
                state.add(pin);
            }
            LogOpKind::Unpin => {
                let cid = self.target.decode_cid()?;
                state.remove(&cid);
            }
        }
        Ok(())
    }

    /// Applies the operation to a type-erased state handle.
    ///
    /// # Panics
    ///
    /// Panics if `state` is neither a [`MapState`] nor a `Box<dyn PinState>`.
    /// Passing anything else is a bug in the caller; the consensus applier is
    /// the only place that catches this.
    pub fn apply_to_any(&self, state: &mut dyn Any) -> Result<(), ApplyError> {
        let Some(state) = as_pin_state(state) else {
            panic!("apply_to_any: state handle does not implement PinState");
        };
        self.apply_to(state)
    }
}

impl std::fmt::Display for LogOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            LogOpKind::Pin => write!(f, "pin {}", self.target.cid),
            LogOpKind::Unpin => write!(f, "unpin {}", self.target.cid),
        }
    }
}

fn as_pin_state(state: &mut dyn Any) -> Option<&mut (dyn PinState + 'static)> {
    if state.is::<MapState>() {
        return state
            .downcast_mut::<MapState>()
            .map(|s| s as &mut (dyn PinState + 'static));
    }
    state
        .downcast_mut::<Box<dyn PinState>>()
        .map(|s| s.as_mut())
}
