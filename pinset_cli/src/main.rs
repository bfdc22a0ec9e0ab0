use crate::init_config::CmdConfig;
use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::InfoLevel;
use directories::ProjectDirs;

mod cmd;
mod helpers;
mod init_config;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// which pinset node this command should run on
    #[arg(short, long, value_name = "NAME", default_value = "local")]
    node: String,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Modify the node's config
    Config {
        #[command(subcommand)]
        cmd: CmdConfig,
    },
    /// Start the node and serve the replicated pin set
    Start,
    /// Print this node's peer id
    Id,
    /// Pin operations against the cluster
    Pin {
        /// Name of a peer in the node config to talk to instead of this node
        #[arg(short, long)]
        peer: Option<String>,
        #[command(subcommand)]
        cmd: PinCmd,
    },
    /// Show the consensus status of a replica
    Status {
        #[arg(short, long)]
        peer: Option<String>,
    },
    /// Change the cluster membership (sent to the leader)
    Peers {
        #[arg(short, long)]
        peer: Option<String>,
        #[command(subcommand)]
        cmd: PeersCmd,
    },
    /// Compact the replica's log into a snapshot now
    Snapshot {
        #[arg(short, long)]
        peer: Option<String>,
    },
}

#[derive(Subcommand)]
enum PinCmd {
    /// Pin a CID
    Add {
        cid: String,
        /// Replicas to keep; -1 pins everywhere
        #[arg(
            short,
            long,
            value_name = "COUNT",
            default_value_t = -1,
            allow_negative_numbers = true
        )]
        replication_factor: i32,
    },
    /// Unpin a CID
    Rm { cid: String },
    /// List all pins
    Ls,
    /// Show the pin of a CID
    Get { cid: String },
}

#[derive(Subcommand)]
enum PeersCmd {
    /// Add a voting member by peer id
    Add { peer_id: String },
    /// Remove a member by peer id
    Rm { peer_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    // Configs under ~/.config/pinset/<node>.toml,
    // replicated logs under ~/.local/share/pinset/<node>/
    let dirs = ProjectDirs::from("", "", "pinset")
        .context("failed to determine config directory path")?;

    let node_config_file = dirs.config_dir().join(&cli.node).with_extension("toml");
    let node_data_dir = dirs.data_dir().join(&cli.node);

    cmd::run_command(node_config_file, &node_data_dir, cli.cmd).await
}
