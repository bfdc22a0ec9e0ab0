use anyhow::{Context, Result};

use super::Target;
use crate::PeersCmd;
use crate::helpers::{on_leader, parse_peer_id};

pub async fn run_status(target: &Target) -> Result<()> {
    let status = target
        .client
        .status()
        .await
        .context("failed to query status")?;
    println!("peer:           {}", status.id);
    println!("role:           {}", status.role);
    println!("term:           {}", status.term);
    match status.leader {
        Some(leader) => println!("leader:         {leader}"),
        None => println!("leader:         unknown"),
    }
    println!("last applied:   {}", status.last_applied);
    println!("last log index: {}", status.last_log_index);
    println!("snapshot index: {}", status.snapshot_index);
    println!("applied ops:    {} ({} failed)", status.applied, status.failed);
    println!("members:");
    for member in &status.members {
        println!("  {member}");
    }
    if !status.learners.is_empty() {
        println!("learners:");
        for learner in &status.learners {
            println!("  {learner}");
        }
    }
    if let Some(reason) = status.fatal {
        println!("halted: {reason}");
    }
    Ok(())
}

pub async fn run_peers(cmd: PeersCmd, target: &Target) -> Result<()> {
    match cmd {
        PeersCmd::Add { peer_id } => {
            let peer = parse_peer_id(&peer_id)?;
            let index = on_leader(&target.endpoint, &target.client, async |client| {
                client.add_peer(peer).await
            })
            .await
            .context("failed to add peer")?;
            println!("added {peer} at index {index}");
        }
        PeersCmd::Rm { peer_id } => {
            let peer = parse_peer_id(&peer_id)?;
            let index = on_leader(&target.endpoint, &target.client, async |client| {
                client.remove_peer(peer).await
            })
            .await
            .context("failed to remove peer")?;
            println!("removed {peer} at index {index}");
        }
    }
    Ok(())
}

pub async fn run_snapshot(target: &Target) -> Result<()> {
    let snapshot = target
        .client
        .snapshot()
        .await
        .context("failed to take snapshot")?;
    println!(
        "snapshot at index {} (term {})",
        snapshot.index, snapshot.term
    );
    Ok(())
}
