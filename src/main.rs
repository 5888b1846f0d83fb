//! Shoal CLI - main entry point.

use clap::{Parser, Subcommand};
use shoal::config::MasterConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shoal", version, about = "Shoal distributed file system master")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a master node.
    Server {
        /// Path to a JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Master node id (overrides the config file).
        #[arg(long)]
        node_id: Option<u64>,

        /// Raft bind address, e.g. 0.0.0.0:9400.
        #[arg(long)]
        bind: Option<String>,

        /// Peer list as id=host:port pairs, comma separated.
        #[arg(long)]
        peers: Option<String>,

        /// Directory for raft state and snapshots.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            config,
            node_id,
            bind,
            peers,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => MasterConfig::from_file(&path)?,
                None => MasterConfig::development(),
            };

            if let Some(id) = node_id {
                config.node.id = id;
            }
            if let Some(bind) = bind {
                config.raft.bind_addr = bind.parse()?;
            }
            if let Some(peers) = peers {
                config.raft.peers = parse_peers(&peers)?;
            }
            if let Some(dir) = data_dir {
                config.storage.metadata_dir = dir;
            }
            config.observability.log_level = cli.log_level;
            config.validate()?;

            shoal::run(config).await?;
        }
    }

    Ok(())
}

/// Parse `1=10.0.0.1:9400,2=10.0.0.2:9400` into a peer map.
fn parse_peers(spec: &str) -> anyhow::Result<std::collections::HashMap<u64, String>> {
    let mut peers = std::collections::HashMap::new();
    for pair in spec.split(',').filter(|s| !s.is_empty()) {
        let (id, addr) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("bad peer spec: {pair}"))?;
        peers.insert(id.trim().parse::<u64>()?, addr.trim().to_string());
    }
    Ok(peers)
}
