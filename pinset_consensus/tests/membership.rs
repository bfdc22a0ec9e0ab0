//! Adding and removing voters one at a time.
//!
//! To run these tests: `cargo test -p pinset_consensus --test membership`

mod common;

use anyhow::Result;
use common::{Cluster, WAIT, peer, test_cid, test_config};
use pinset_consensus::{ConsensusError, RaftConfig, Role};
use pinset_core::ReplicationFactor;
use pinset_logstore_memory::MemoryLogStore;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn added_peer_catches_up() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let leader = cluster.wait_for_leader(&cluster.ids()).await?;
    for n in 0..5 {
        leader
            .submit_pin(&test_cid(n), ReplicationFactor::EVERYWHERE)
            .await?;
    }

    let joiner = cluster
        .start_peer(peer(4), None, Arc::new(MemoryLogStore::new()))
        .await?;
    assert!(joiner.status().members.is_empty());

    let index = leader.add_peer(peer(4)).await?;
    let all = [peer(1), peer(2), peer(3), peer(4)];
    cluster.wait_applied(&all, index).await?;
    assert_eq!(joiner.list_pins(), leader.list_pins());
    for id in all {
        assert_eq!(cluster.raft(id).status().members, all.to_vec(), "peer {id}");
    }

    // Adding a member twice changes nothing.
    assert_eq!(leader.add_peer(peer(4)).await?, index);

    let index = leader
        .submit_pin(&test_cid(99), ReplicationFactor::EVERYWHERE)
        .await?;
    cluster.wait_applied(&all, index).await?;
    assert!(joiner.get_pin(&test_cid(99)).is_some());

    cluster.shutdown().await;
    cluster.kill(peer(4)).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removed_follower_stops_receiving() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let leader = cluster.wait_for_leader(&cluster.ids()).await?;
    let removed = cluster
        .ids()
        .into_iter()
        .find(|id| *id != leader.id())
        .expect("a follower");
    let remaining: Vec<_> = cluster
        .ids()
        .into_iter()
        .filter(|id| *id != removed)
        .collect();

    let index = leader.remove_peer(removed).await?;
    cluster.wait_applied(&remaining, index).await?;
    assert_eq!(leader.status().members, remaining);

    // Two voters left: both are needed, and both are enough.
    let index = leader
        .submit_pin(&test_cid(1), ReplicationFactor::EVERYWHERE)
        .await?;
    cluster.wait_applied(&remaining, index).await?;
    assert!(cluster.raft(removed).get_pin(&test_cid(1)).is_none());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_can_remove_itself() -> Result<()> {
    let cluster = Cluster::start(3).await?;
    let old = cluster.wait_for_leader(&cluster.ids()).await?;
    let remaining: Vec<_> = cluster
        .ids()
        .into_iter()
        .filter(|id| *id != old.id())
        .collect();

    old.remove_peer(old.id()).await?;
    let leader = cluster.wait_for_leader(&remaining).await?;
    assert_ne!(leader.id(), old.id());
    assert_eq!(leader.status().members, remaining);

    let status = old.status();
    assert_ne!(status.role, Role::Leader);
    assert!(!status.members.contains(&old.id()));

    leader
        .submit_pin(&test_cid(1), ReplicationFactor::EVERYWHERE)
        .await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_change_at_a_time() -> Result<()> {
    // Long election timeouts keep the leader in office while it is cut off.
    let config = RaftConfig {
        election_timeout_min_ms: 2000,
        election_timeout_max_ms: 4000,
        ..test_config()
    };
    let cluster = Cluster::start_with(3, config).await?;
    let leader = cluster.wait_for_leader(&cluster.ids()).await?;
    let followers: Vec<_> = cluster
        .ids()
        .into_iter()
        .filter(|id| *id != leader.id())
        .collect();

    cluster.net.partition(&[leader.id()], &followers);
    let pending = tokio::spawn({
        let leader = leader.clone();
        async move { leader.add_peer(peer(4)).await }
    });

    // The new configuration is in effect as soon as it is appended.
    let mut status = leader.subscribe_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| s.learners.contains(&peer(4)))).await??;

    assert_eq!(
        leader.add_peer(peer(5)).await,
        Err(ConsensusError::MembershipChangeInProgress)
    );

    cluster.net.heal();
    // Peer 4 never starts, but three of four voters are a quorum.
    let index = pending.await??;
    assert!(index > 0);
    let index = leader.add_peer(peer(5)).await?;
    assert!(index > 0);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_member_cannot_leave() -> Result<()> {
    let cluster = Cluster::start(1).await?;
    let raft = cluster.raft(peer(1));
    raft.wait_for_leader(Duration::from_secs(5)).await?;

    let err = raft.remove_peer(peer(1)).await.unwrap_err();
    assert!(matches!(err, ConsensusError::Config(_)), "{err:?}");
    assert_eq!(raft.status().members, vec![peer(1)]);

    cluster.shutdown().await;
    Ok(())
}
