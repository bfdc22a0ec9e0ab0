use crate::error::ConsensusError;
use crate::snapshot;
use crate::types::{
    self, ApplyResult, Entry, LogId, RaftSnapshotMeta, StorageError, StoredMembership, TypeConfig,
    storage_error,
};
use bytes::Bytes;
use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{ErrorSubject, ErrorVerb, OptionalSend};
use pinset_core::{ApplyError, Cid, LogOp, LogStore, Pin, PinState, StateError};
use std::any::Any;
use std::io::Cursor;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Pin state shared between the applier (sole writer) and readers.
pub(crate) type SharedState = Arc<RwLock<dyn PinState>>;

/// Outcome counts of applied operations.
#[derive(Debug, Default)]
pub(crate) struct ApplyCounters {
    applied: AtomicU64,
    failed: AtomicU64,
}

impl ApplyCounters {
    pub(crate) fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// The snapshot peers are served, sealed with its checksum.
#[derive(Debug, Clone)]
struct CurrentSnapshot {
    meta: RaftSnapshotMeta,
    data: Vec<u8>,
}

impl CurrentSnapshot {
    fn to_snapshot(&self) -> Snapshot<TypeConfig> {
        Snapshot {
            meta: self.meta.clone(),
            snapshot: Box::new(Cursor::new(self.data.clone())),
        }
    }
}

/// Applies committed entries to the local pin state, one at a time.
///
/// openraft drives the applier from a single task, so application is
/// serialized. Readers share the state through [`SharedState`] and only
/// ever wait for a single in-progress apply or export.
///
/// Snapshots are built from the state, persisted to the [`LogStore`] and
/// installed from peers here as well.
pub struct Applier {
    state: SharedState,
    store: Arc<dyn LogStore>,
    counters: Arc<ApplyCounters>,
    last_applied: Option<LogId>,
    last_membership: StoredMembership,
    current: Arc<Mutex<Option<CurrentSnapshot>>>,
    snapshots_built: Arc<AtomicU64>,
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier")
            .field("last_applied", &self.last_applied)
            .field("applied", &self.counters.applied())
            .field("failed", &self.counters.failed())
            .finish()
    }
}

impl Applier {
    pub fn new<S: PinState>(state: S, store: Arc<dyn LogStore>) -> Self {
        let state: SharedState = Arc::new(RwLock::new(state));
        Self {
            state,
            store,
            counters: Arc::default(),
            last_applied: None,
            last_membership: StoredMembership::default(),
            current: Arc::default(),
            snapshots_built: Arc::default(),
        }
    }

    /// Restores the state from the stored snapshot, if any.
    ///
    /// A stored snapshot that fails its checksum or does not decode is an
    /// error: starting from empty state would silently drop pins.
    pub(crate) async fn load(&mut self) -> Result<(), ConsensusError> {
        let stored = self.store.read_snapshot().await.map_err(ConsensusError::storage)?;
        let Some((data, meta)) = stored else {
            return Ok(());
        };
        let state = snapshot::unseal(&data)
            .map_err(|e| ConsensusError::Snapshot(format!("stored snapshot {}: {e}", meta.snapshot_id)))?;
        self.restore(state)
            .map_err(|e| ConsensusError::Snapshot(format!("stored snapshot {}: {e}", meta.snapshot_id)))?;

        let meta = types::raft_snapshot_meta(&meta);
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        tracing::info!(snapshot = %meta.snapshot_id, "restored pin state from snapshot");
        *self.current.lock().await = Some(CurrentSnapshot {
            meta,
            data: data.to_vec(),
        });
        Ok(())
    }

    pub(crate) fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub(crate) fn counters(&self) -> Arc<ApplyCounters> {
        self.counters.clone()
    }

    /// Index of the last entry handed to the applier.
    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied.map(|id| id.index)
    }

    /// Applies one committed entry. Entries must arrive in index order.
    ///
    /// Blank and membership entries only advance the applied position.
    pub fn apply_entry(&mut self, entry: &Entry) -> ApplyResult {
        debug_assert!(
            self.last_applied
                .is_none_or(|last| entry.log_id.index == last.index + 1),
            "entries must be applied in order"
        );
        self.last_applied = Some(entry.log_id);
        let op = match &entry.payload {
            openraft::EntryPayload::Blank => return Ok(()),
            openraft::EntryPayload::Membership(membership) => {
                self.last_membership = StoredMembership::new(Some(entry.log_id), membership.clone());
                return Ok(());
            }
            openraft::EntryPayload::Normal(op) => op,
        };
        let result = self.apply_op(op);
        let index = entry.log_id.index;
        match &result {
            Ok(()) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(index, %op, "applied");
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(index, "committed entry failed to apply: {err}");
            }
        }
        result
    }

    fn apply_op(&self, op: &LogOp) -> Result<(), ApplyError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        op.apply_to(&mut *state)
    }

    /// Applies `op` to a type-erased state handle.
    ///
    /// This is the boundary for handles whose type is only known at run
    /// time: a handle that is not a pin state makes the operation abort, and
    /// the abort is turned into [`ApplyError::NonConformingState`] here.
    pub fn apply_untyped(op: &LogOp, state: &mut dyn Any) -> Result<(), ApplyError> {
        match catch_unwind(AssertUnwindSafe(|| op.apply_to_any(state))) {
            Ok(result) => result,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "apply aborted".to_string());
                tracing::error!("rejected non-conforming state handle: {reason}");
                Err(ApplyError::NonConformingState(reason))
            }
        }
    }

    pub fn export(&self) -> Result<Vec<u8>, StateError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.export()
    }

    fn restore(&self, bytes: &[u8]) -> Result<(), StateError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.restore(bytes)
    }
}

/// Replaces `current` unless it already holds a newer snapshot, and
/// persists the replacement.
async fn keep_snapshot(
    store: &dyn LogStore,
    current: &Mutex<Option<CurrentSnapshot>>,
    snapshot: CurrentSnapshot,
) -> Result<(), StorageError> {
    let mut current = current.lock().await;
    if current
        .as_ref()
        .is_some_and(|c| c.meta.last_log_id > snapshot.meta.last_log_id)
    {
        tracing::debug!(snapshot = %snapshot.meta.snapshot_id, "newer snapshot already kept");
        return Ok(());
    }
    store
        .write_snapshot(Bytes::from(snapshot.data.clone()), types::snapshot_meta(&snapshot.meta))
        .await
        .map_err(|e| {
            storage_error(
                ErrorSubject::Snapshot(Some(snapshot.meta.signature())),
                ErrorVerb::Write,
                e,
            )
        })?;
    *current = Some(snapshot);
    Ok(())
}

/// Builds a snapshot of the state as it was when the builder was created.
pub struct SnapshotBuilder {
    exported: Result<Vec<u8>, StateError>,
    last_applied: Option<LogId>,
    last_membership: StoredMembership,
    store: Arc<dyn LogStore>,
    current: Arc<Mutex<Option<CurrentSnapshot>>>,
    snapshots_built: Arc<AtomicU64>,
}

impl RaftSnapshotBuilder<TypeConfig> for SnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError> {
        let exported = std::mem::replace(&mut self.exported, Ok(Vec::new()));
        let state = exported.map_err(|e| {
            storage_error(ErrorSubject::StateMachine, ErrorVerb::Read, e)
        })?;
        let seq = self.snapshots_built.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = match &self.last_applied {
            Some(id) => format!("{}-{}-{seq}", id.leader_id.term, id.index),
            None => format!("0-0-{seq}"),
        };
        let snapshot = CurrentSnapshot {
            meta: RaftSnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id,
            },
            data: snapshot::seal(state),
        };
        keep_snapshot(self.store.as_ref(), &self.current, snapshot.clone()).await?;
        tracing::info!(
            snapshot = %snapshot.meta.snapshot_id,
            bytes = snapshot.data.len(),
            "built snapshot"
        );
        Ok(snapshot.to_snapshot())
    }
}

impl RaftStateMachine<TypeConfig> for Applier {
    type SnapshotBuilder = SnapshotBuilder;

    async fn applied_state(&mut self) -> Result<(Option<LogId>, StoredMembership), StorageError> {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyResult>, StorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        Ok(entries
            .into_iter()
            .map(|entry| self.apply_entry(&entry))
            .collect())
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder {
            exported: self.export(),
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            store: self.store.clone(),
            current: self.current.clone(),
            snapshots_built: self.snapshots_built.clone(),
        }
    }

    async fn begin_receiving_snapshot(&mut self) -> Result<Box<Cursor<Vec<u8>>>, StorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    /// Installs a snapshot received from the leader.
    ///
    /// Damaged or undecodable data is an error and leaves the state as it
    /// was; the replica never reports a snapshot it did not install.
    async fn install_snapshot(
        &mut self,
        meta: &RaftSnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError> {
        let data = snapshot.into_inner();
        let subject = || ErrorSubject::Snapshot(Some(meta.signature()));
        let state = snapshot::unseal(&data).map_err(|e| storage_error(subject(), ErrorVerb::Read, e))?;
        self.restore(state)
            .map_err(|e| storage_error(subject(), ErrorVerb::Read, e))?;
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();

        let snapshot = CurrentSnapshot {
            meta: meta.clone(),
            data,
        };
        keep_snapshot(self.store.as_ref(), &self.current, snapshot).await?;
        tracing::info!(snapshot = %meta.snapshot_id, "installed snapshot from leader");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot<TypeConfig>>, StorageError> {
        Ok(self.current.lock().await.as_ref().map(CurrentSnapshot::to_snapshot))
    }
}

/// Read helpers on the shared state.
pub(crate) fn list(state: &SharedState) -> Vec<Pin> {
    state.read().unwrap_or_else(PoisonError::into_inner).list()
}

pub(crate) fn get(state: &SharedState, cid: &Cid) -> Option<Pin> {
    state.read().unwrap_or_else(PoisonError::into_inner).get(cid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::CommittedLeaderId;
    use pinset_core::{LogOpKind, MapState, PeerId, PinSerial};
    use pinset_logstore_memory::MemoryLogStore;

    const TEST_CID_1: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmmq";
    const TEST_CID_2: &str = "QmP63DkAFEnDYNjDYBpyNDfttu1fvUw99x1brscPzpqmma";

    fn applier() -> Applier {
        Applier::new(MapState::new(), Arc::new(MemoryLogStore::new()))
    }

    fn log_id(index: u64) -> LogId {
        LogId::new(CommittedLeaderId::new(1, PeerId([1; 32])), index)
    }

    fn op_entry(index: u64, cid: &str, kind: LogOpKind) -> Entry {
        Entry {
            log_id: log_id(index),
            payload: openraft::EntryPayload::Normal(LogOp::new(PinSerial::new(cid, -1), kind)),
        }
    }

    #[test]
    fn test_bad_entry_does_not_stall_stream() {
        let mut applier = applier();
        applier
            .apply_entry(&op_entry(1, TEST_CID_1, LogOpKind::Pin))
            .unwrap();
        assert!(matches!(
            applier.apply_entry(&op_entry(2, "agadfaegf", LogOpKind::Pin)),
            Err(ApplyError::MalformedCid { .. })
        ));
        applier
            .apply_entry(&op_entry(3, TEST_CID_2, LogOpKind::Pin))
            .unwrap();
        applier
            .apply_entry(&Entry {
                log_id: log_id(4),
                payload: openraft::EntryPayload::Blank,
            })
            .unwrap();

        assert_eq!(applier.last_applied(), Some(4));
        assert_eq!(applier.counters().applied(), 2);
        assert_eq!(applier.counters().failed(), 1);
        assert_eq!(list(&applier.state()).len(), 2);
    }

    #[test]
    fn test_same_sequence_same_state() {
        let entries = vec![
            op_entry(1, TEST_CID_1, LogOpKind::Pin),
            op_entry(2, TEST_CID_2, LogOpKind::Pin),
            op_entry(3, "agadfaegf", LogOpKind::Unpin),
            op_entry(4, TEST_CID_1, LogOpKind::Unpin),
            op_entry(5, TEST_CID_1, LogOpKind::Pin),
        ];
        let mut a = applier();
        let mut b = applier();
        let results_a: Vec<_> = entries.iter().map(|e| a.apply_entry(e)).collect();
        let results_b: Vec<_> = entries.iter().map(|e| b.apply_entry(e)).collect();
        assert_eq!(results_a, results_b);
        assert_eq!(a.export().unwrap(), b.export().unwrap());
    }

    #[test]
    fn test_apply_untyped_boundary() {
        let op = LogOp::new(PinSerial::new(TEST_CID_1, -1), LogOpKind::Pin);

        let mut good = MapState::new();
        Applier::apply_untyped(&op, &mut good).unwrap();
        assert!(good.has(&Cid::parse(TEST_CID_1).unwrap()));

        let mut bad = 42u32;
        let err = Applier::apply_untyped(&op, &mut bad).unwrap_err();
        assert!(matches!(err, ApplyError::NonConformingState(ref msg) if msg.contains("PinState")));
        assert_eq!(bad, 42);
    }

    #[tokio::test]
    async fn test_built_snapshot_installs_on_another_replica() {
        let mut leader = applier();
        leader
            .apply_entry(&op_entry(1, TEST_CID_1, LogOpKind::Pin))
            .unwrap();
        let snapshot = leader
            .get_snapshot_builder()
            .await
            .build_snapshot()
            .await
            .unwrap();
        assert_eq!(snapshot.meta.last_log_id, Some(log_id(1)));

        let mut follower = applier();
        follower
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();
        assert_eq!(follower.last_applied(), Some(1));
        assert_eq!(list(&follower.state()), list(&leader.state()));
        let served = follower.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(served.meta, snapshot.meta);
    }

    #[tokio::test]
    async fn test_damaged_snapshot_is_not_installed() {
        let mut leader = applier();
        leader
            .apply_entry(&op_entry(1, TEST_CID_1, LogOpKind::Pin))
            .unwrap();
        let snapshot = leader
            .get_snapshot_builder()
            .await
            .build_snapshot()
            .await
            .unwrap();
        let mut data = snapshot.snapshot.into_inner();
        data[0] ^= 0xff;

        let store = Arc::new(MemoryLogStore::new());
        let mut follower = Applier::new(MapState::new(), store.clone());
        follower
            .apply_entry(&op_entry(1, TEST_CID_2, LogOpKind::Pin))
            .unwrap();
        let result = follower
            .install_snapshot(&snapshot.meta, Box::new(Cursor::new(data)))
            .await;
        assert!(result.is_err());

        // Nothing changed: state, position, served and stored snapshot.
        assert_eq!(follower.last_applied(), Some(1));
        let pins = list(&follower.state());
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].cid, Cid::parse(TEST_CID_2).unwrap());
        assert!(follower.get_current_snapshot().await.unwrap().is_none());
        assert!(store.read_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_restores_and_refuses_damaged_snapshot() {
        let store = Arc::new(MemoryLogStore::new());
        let mut first = Applier::new(MapState::new(), store.clone());
        first
            .apply_entry(&op_entry(1, TEST_CID_1, LogOpKind::Pin))
            .unwrap();
        first.get_snapshot_builder().await.build_snapshot().await.unwrap();

        let mut restarted = Applier::new(MapState::new(), store.clone());
        restarted.load().await.unwrap();
        assert_eq!(restarted.last_applied(), Some(1));
        assert_eq!(list(&restarted.state()), list(&first.state()));
        assert!(restarted.get_current_snapshot().await.unwrap().is_some());

        let (data, meta) = store.read_snapshot().await.unwrap().unwrap();
        let mut damaged = data.to_vec();
        damaged.truncate(damaged.len() - 1);
        store.write_snapshot(Bytes::from(damaged), meta).await.unwrap();
        let mut broken = Applier::new(MapState::new(), store);
        assert!(matches!(broken.load().await, Err(ConsensusError::Snapshot(_))));
        assert!(list(&broken.state()).is_empty());
    }
}
