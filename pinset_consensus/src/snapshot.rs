//! Snapshot data as stored and sent to peers: the exported pin state
//! followed by its blake3 hash.
//!
//! A replica checks the hash before it replaces its state, so a snapshot
//! damaged on disk or in flight is refused instead of installed.

const HASH_LEN: usize = blake3::OUT_LEN;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot of {0} bytes is too short to carry a checksum")]
    Truncated(usize),
    #[error("snapshot checksum mismatch")]
    Checksum,
}

/// Appends the checksum to exported state.
pub fn seal(mut state: Vec<u8>) -> Vec<u8> {
    let hash = blake3::hash(&state);
    state.extend_from_slice(hash.as_bytes());
    state
}

/// Verifies sealed snapshot data and returns the state part.
pub fn unseal(data: &[u8]) -> Result<&[u8], SnapshotError> {
    if data.len() < HASH_LEN {
        return Err(SnapshotError::Truncated(data.len()));
    }
    let (state, hash) = data.split_at(data.len() - HASH_LEN);
    let expected: [u8; HASH_LEN] = hash.try_into().map_err(|_| SnapshotError::Checksum)?;
    // blake3::Hash compares in constant time.
    if blake3::hash(state) != blake3::Hash::from_bytes(expected) {
        return Err(SnapshotError::Checksum);
    }
    Ok(state)
}
