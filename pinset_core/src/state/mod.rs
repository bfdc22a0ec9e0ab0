//! The authoritative pin mapping.

mod map;

pub use map::MapState;

use crate::cid::Cid;
use crate::pin::Pin;

/// Current version of the snapshot blob produced by [`PinState::export`].
pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("failed to encode state: {0}")]
    Encode(String),
    #[error("failed to decode state: {0}")]
    Decode(String),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot contains an invalid cid: {0}")]
    InvalidCid(#[from] crate::cid::CidError),
    #[error("snapshot contains an invalid replication factor {0}")]
    InvalidReplicationFactor(i32),
}

/// Capability set of a pin state.
///
/// Implementations are plain data with no knowledge of consensus. Mutation
/// happens only through committed log operations, one at a time; callers
/// that read concurrently coordinate through a lock around the state.
pub trait PinState: Send + Sync + 'static {
    /// Inserts or overwrites the pin for `pin.cid`.
    fn add(&mut self, pin: Pin);

    /// Removes the pin for `cid`. Removing an absent cid is a no-op.
    fn remove(&mut self, cid: &Cid);

    /// All pins, in an order that is stable for one call.
    fn list(&self) -> Vec<Pin>;

    fn has(&self, cid: &Cid) -> bool;

    fn get(&self, cid: &Cid) -> Option<Pin>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the whole state into an opaque, versioned blob.
    fn export(&self) -> Result<Vec<u8>, StateError>;

    /// Replaces the whole state with the content of an exported blob.
    ///
    /// On error the current content is left untouched.
    fn restore(&mut self, bytes: &[u8]) -> Result<(), StateError>;
}

impl<S: PinState + ?Sized> PinState for Box<S> {
    fn add(&mut self, pin: Pin) {
        (**self).add(pin)
    }

    fn remove(&mut self, cid: &Cid) {
        (**self).remove(cid)
    }

    fn list(&self) -> Vec<Pin> {
        (**self).list()
    }

    fn has(&self, cid: &Cid) -> bool {
        (**self).has(cid)
    }

    fn get(&self, cid: &Cid) -> Option<Pin> {
        (**self).get(cid)
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn export(&self) -> Result<Vec<u8>, StateError> {
        (**self).export()
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        (**self).restore(bytes)
    }
}
