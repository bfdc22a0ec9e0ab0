//! A replica whose log store fails stops instead of diverging.
//!
//! To run this test: `cargo test -p pinset_consensus --test storage_failure`

mod common;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use common::{Cluster, peer, test_cid};
use pinset_consensus::{ConsensusError, Role};
use pinset_core::{
    EntryId, HardState, LogEntry, LogStore, Membership, ReplicationFactor, SnapshotMeta,
};
use pinset_logstore_memory::MemoryLogStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Wraps a store and fails every append once `broken` is set.
#[derive(Debug, Default)]
struct FlakyStore {
    inner: MemoryLogStore,
    broken: AtomicBool,
}

#[async_trait]
impl LogStore for FlakyStore {
    async fn append(&self, entries: Vec<LogEntry>) -> Result<u64> {
        if self.broken.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.append(entries).await
    }
    async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        self.inner.entry(index).await
    }
    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        self.inner.entries(from, to).await
    }
    async fn last_entry_id(&self) -> Result<Option<EntryId>> {
        self.inner.last_entry_id().await
    }
    async fn last_purged(&self) -> Result<Option<EntryId>> {
        self.inner.last_purged().await
    }
    async fn truncate_suffix(&self, from: u64) -> Result<()> {
        self.inner.truncate_suffix(from).await
    }
    async fn truncate_prefix(&self, upto: EntryId) -> Result<()> {
        self.inner.truncate_prefix(upto).await
    }
    async fn write_snapshot(&self, data: Bytes, meta: SnapshotMeta) -> Result<()> {
        self.inner.write_snapshot(data, meta).await
    }
    async fn read_snapshot(&self) -> Result<Option<(Bytes, SnapshotMeta)>> {
        self.inner.read_snapshot().await
    }
    async fn save_hard_state(&self, state: HardState) -> Result<()> {
        self.inner.save_hard_state(state).await
    }
    async fn hard_state(&self) -> Result<Option<HardState>> {
        self.inner.hard_state().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn append_failure_stops_the_replica() -> Result<()> {
    let cluster = Cluster {
        net: pinset_consensus::SimNetwork::new(),
        config: common::test_config(),
        members: Membership::new([peer(1)]),
    };
    let store = Arc::new(FlakyStore::default());
    let raft = cluster
        .start_peer(peer(1), Some(cluster.members.clone()), store.clone())
        .await?;
    raft.wait_for_leader(Duration::from_secs(5)).await?;
    raft.submit_pin(&test_cid(1), ReplicationFactor::EVERYWHERE)
        .await?;

    store.broken.store(true, Ordering::SeqCst);
    let err = raft
        .submit_pin(&test_cid(2), ReplicationFactor::EVERYWHERE)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::Storage(ref msg) if msg.contains("disk full")), "{err:?}");

    let err = raft
        .submit_pin(&test_cid(3), ReplicationFactor::EVERYWHERE)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::Stopped(_)), "{err:?}");

    let status = raft.status();
    assert_eq!(status.role, Role::Stopped);
    assert!(status.fatal.is_some());
    assert!(matches!(
        raft.wait_for_leader(Duration::from_secs(1)).await,
        Err(ConsensusError::Stopped(_))
    ));
    // Reads keep serving the last applied state.
    assert_eq!(raft.list_pins().len(), 1);

    raft.shutdown().await;
    Ok(())
}
