//! Log compaction, snapshot transfer and recovery from disk.
//!
//! To run these tests: `cargo test -p pinset_consensus --test snapshot`

mod common;

use anyhow::Result;
use common::{Cluster, peer, test_cid, test_config};
use openraft::CommittedLeaderId;
use pinset_consensus::message::SnapshotRequest;
use pinset_consensus::types::{LogId, RaftSnapshotMeta, StoredMembership, Vote};
use pinset_consensus::{ConsensusError, RaftConfig, RaftRequest, Role};
use pinset_core::{LogStore, Membership, ReplicationFactor};
use pinset_logstore_redb::RedbLogStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn compacting_config(threshold: u64) -> RaftConfig {
    RaftConfig {
        snapshot_threshold: threshold,
        ..test_config()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_is_compacted_past_threshold() -> Result<()> {
    let cluster = Cluster::start_with(3, compacting_config(20)).await?;
    let leader = cluster.wait_for_leader(&cluster.ids()).await?;

    let mut last = 0;
    for n in 0..50 {
        last = leader
            .submit_pin(&test_cid(n), ReplicationFactor::EVERYWHERE)
            .await?;
    }
    cluster.wait_applied(&cluster.ids(), last).await?;
    for id in cluster.ids() {
        let status = cluster.raft(id).status();
        assert!(status.snapshot_index > 0, "peer {id}: {status:?}");
        assert_eq!(cluster.raft(id).list_pins().len(), 50);
    }

    let snapshot = leader.trigger_snapshot().await?;
    assert_eq!(snapshot.index, leader.status().last_applied);
    // Nothing new was applied, so this is a no-op.
    assert_eq!(leader.trigger_snapshot().await?, snapshot);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_installs_snapshot() -> Result<()> {
    let cluster = Cluster::start_with(3, compacting_config(10)).await?;
    let leader = cluster.wait_for_leader(&cluster.ids()).await?;
    let lagging = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader.id())
        .expect("a follower");

    cluster.net.isolate(lagging);
    let mut last = 0;
    for n in 0..40 {
        last = leader
            .submit_pin(&test_cid(n), ReplicationFactor::EVERYWHERE)
            .await?;
    }
    for n in [3, 5] {
        last = leader.submit_unpin(&test_cid(n)).await?;
    }
    assert!(leader.status().snapshot_index > 1);

    cluster.net.heal();
    cluster.wait_applied(&[lagging], last).await?;
    let follower = cluster.raft(lagging);
    assert_eq!(follower.list_pins(), leader.list_pins());
    assert_eq!(follower.list_pins().len(), 38);
    assert!(follower.status().snapshot_index > 0);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn garbage_snapshot_is_refused_and_replica_keeps_running() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let leader = cluster.wait_for_leader(&cluster.ids()).await?;
    let follower = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader.id())
        .map(|id| cluster.raft(id))
        .expect("a follower");

    let request = SnapshotRequest {
        vote: Vote::new_committed(5, peer(9)),
        meta: RaftSnapshotMeta {
            last_log_id: Some(LogId::new(CommittedLeaderId::new(5, peer(9)), 500)),
            last_membership: StoredMembership::default(),
            snapshot_id: "5-500-1".into(),
        },
        offset: 0,
        data: b"garbage".to_vec(),
        done: true,
    };
    let result = follower
        .handle_request(RaftRequest::InstallSnapshot(request))
        .await;
    assert!(
        matches!(result, Err(ConsensusError::Snapshot(_))),
        "{result:?}"
    );

    let status = follower.status();
    assert_eq!(status.fatal, None);
    assert_ne!(status.role, Role::Stopped);
    assert!(status.last_applied < 500);
    assert_eq!(status.snapshot_index, 0);

    let index = leader
        .submit_pin(&test_cid(1), ReplicationFactor::EVERYWHERE)
        .await?;
    cluster.wait_applied(&cluster.ids(), index).await?;
    assert!(follower.has_pin(&test_cid(1)));

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn damaged_snapshot_transfer_is_retried() -> Result<()> {
    let cluster = Cluster::start_with(3, compacting_config(10)).await?;
    let leader = cluster.wait_for_leader(&cluster.ids()).await?;
    let lagging = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader.id())
        .expect("a follower");

    cluster.net.isolate(lagging);
    let mut last = 0;
    for n in 0..40 {
        last = leader
            .submit_pin(&test_cid(n), ReplicationFactor::EVERYWHERE)
            .await?;
    }
    assert!(leader.status().snapshot_index > 1);

    cluster.net.corrupt_snapshots(true);
    cluster.net.heal();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let follower = cluster.raft(lagging);
    let status = follower.status();
    assert!(status.last_applied < last, "{status:?}");
    assert_eq!(status.fatal, None);
    assert_ne!(status.role, Role::Stopped);

    cluster.net.corrupt_snapshots(false);
    cluster.wait_applied(&[lagging], last).await?;
    assert_eq!(follower.list_pins(), leader.list_pins());
    assert_eq!(follower.list_pins().len(), 40);
    assert_eq!(follower.status().fatal, None);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_recovers_pins_from_disk() -> Result<()> {
    let dir = tempdir()?;
    let cluster = Cluster {
        net: pinset_consensus::SimNetwork::new(),
        config: compacting_config(10_000),
        members: Membership::new([peer(1)]),
    };

    let expected = {
        let store = Arc::new(RedbLogStore::open(dir.path())?);
        let raft = cluster
            .start_peer(peer(1), Some(cluster.members.clone()), store.clone())
            .await?;
        raft.wait_for_leader(Duration::from_secs(5)).await?;
        for n in 0..5 {
            raft.submit_pin(&test_cid(n), ReplicationFactor::EVERYWHERE)
                .await?;
        }
        raft.trigger_snapshot().await?;
        raft.submit_unpin(&test_cid(0)).await?;
        raft.submit_pin(&test_cid(9), ReplicationFactor::new(3)?)
            .await?;
        let pins = raft.list_pins();
        let term = raft.status().term;

        cluster.kill(peer(1)).await;
        drop(raft);
        // The raft core releases its store handles as it exits.
        while Arc::strong_count(&store) > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.hard_state().await?.map(|h| h.term), Some(term));
        pins
    };
    assert_eq!(expected.len(), 5);

    let store = Arc::new(RedbLogStore::open(dir.path())?);
    let raft = cluster
        .start_peer(peer(1), Some(cluster.members.clone()), store)
        .await?;
    // Committed entries are replayed before the handle is returned.
    assert_eq!(raft.list_pins(), expected);
    raft.wait_for_leader(Duration::from_secs(5)).await?;
    raft.submit_pin(&test_cid(10), ReplicationFactor::EVERYWHERE)
        .await?;
    assert_eq!(raft.list_pins().len(), 6);

    cluster.kill(peer(1)).await;
    Ok(())
}
