use anyhow::{Context, Result};
use pinset_core::{Cid, ReplicationFactor};

use super::Target;
use crate::PinCmd;
use crate::helpers::on_leader;

fn parse_cid(cid: &str) -> Result<Cid> {
    Cid::parse(cid).with_context(|| format!("invalid cid '{cid}'"))
}

pub async fn run_pin(cmd: PinCmd, target: &Target) -> Result<()> {
    match cmd {
        PinCmd::Add {
            cid,
            replication_factor,
        } => {
            let cid = parse_cid(&cid)?;
            let replication_factor = ReplicationFactor::new(replication_factor)?;
            let index = on_leader(&target.endpoint, &target.client, async |client| {
                client.pin(&cid, replication_factor).await
            })
            .await
            .context("failed to pin")?;
            println!("pinned {cid} (replication factor {replication_factor}) at index {index}");
        }
        PinCmd::Rm { cid } => {
            let cid = parse_cid(&cid)?;
            let index = on_leader(&target.endpoint, &target.client, async |client| {
                client.unpin(&cid).await
            })
            .await
            .context("failed to unpin")?;
            println!("unpinned {cid} at index {index}");
        }
        PinCmd::Ls => {
            let mut pins = target.client.list().await.context("failed to list pins")?;
            pins.sort_by(|a, b| a.cid.cmp(&b.cid));
            for pin in &pins {
                println!("{}\t{}", pin.cid, pin.replication_factor);
            }
            println!("{} pins", pins.len());
        }
        PinCmd::Get { cid } => {
            let cid = parse_cid(&cid)?;
            match target.client.get(&cid).await? {
                Some(pin) => println!("{}\t{}", pin.cid, pin.replication_factor),
                None => println!("{cid} is not pinned"),
            }
        }
    }
    Ok(())
}
