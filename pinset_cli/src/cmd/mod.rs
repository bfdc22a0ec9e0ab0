use std::path::{Path, PathBuf};

use anyhow::Result;
use iroh::Endpoint;
use pinset_net::ApiClient;

use crate::Commands;
use crate::helpers::{build_endpoint, load_config, local_peer_id, peer_endpoint_addr};

mod cluster;
mod pin;

pub use cluster::{run_peers, run_snapshot, run_status};
pub use pin::run_pin;

/// An API connection to one replica of the cluster.
pub struct Target {
    pub endpoint: Endpoint,
    pub client: ApiClient,
}

async fn connect(node_config_file: &Path, peer: Option<&str>) -> Result<Target> {
    let config = load_config(node_config_file)?;
    let addr = peer_endpoint_addr(&config, node_config_file.parent(), peer)?;
    let endpoint = build_endpoint().await?;
    let client = ApiClient::connect(endpoint.clone(), addr);
    Ok(Target { endpoint, client })
}

pub async fn run_command(
    node_config_file: PathBuf,
    node_data_dir: &Path,
    cmd: Commands,
) -> Result<()> {
    match cmd {
        Commands::Config { cmd } => cmd.run(node_config_file, node_data_dir),
        Commands::Start => {
            let config = load_config(&node_config_file)?;
            pinset_node::run_node(node_config_file, config).await
        }
        Commands::Id => {
            let config = load_config(&node_config_file)?;
            println!("{}", local_peer_id(&config, node_config_file.parent())?);
            Ok(())
        }
        Commands::Pin { peer, cmd } => {
            let target = connect(&node_config_file, peer.as_deref()).await?;
            run_pin(cmd, &target).await
        }
        Commands::Status { peer } => {
            let target = connect(&node_config_file, peer.as_deref()).await?;
            run_status(&target).await
        }
        Commands::Peers { peer, cmd } => {
            let target = connect(&node_config_file, peer.as_deref()).await?;
            run_peers(cmd, &target).await
        }
        Commands::Snapshot { peer } => {
            let target = connect(&node_config_file, peer.as_deref()).await?;
            run_snapshot(&target).await
        }
    }
}
