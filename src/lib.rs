//! Shoal - the metadata master of a lightweight distributed file system.
//!
//! The master owns the authoritative directory tree, the chunk catalog,
//! and the data-node catalog. It replicates every mutation through a raft
//! log, reacts to data-node liveness changes, and drives repair traffic
//! for under-replicated chunks.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         Shoal master                         |
//! +--------------------------------------------------------------+
//! |  Facade: client ops | data-node register/heartbeat           |
//! +--------------------------------------------------------------+
//! |  Replicated log: raft consensus | snapshots | apply waiters  |
//! +--------------------------------------------------------------+
//! |  State: path tree | chunk catalog | data-node catalog        |
//! +--------------------------------------------------------------+
//! |  Controllers: liveness ladder | repair loop | peer observer  |
//! +--------------------------------------------------------------+
//! ```
//!
//! Chunk bytes never pass through the master: data nodes ship chunks to
//! each other following the transfer orders the master hands out in
//! heartbeat responses.

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod error;
pub mod master;
pub mod namespace;
pub mod observability;
pub mod placement;
pub mod raft;
pub mod types;

// Re-exports
pub use error::{Result, ShoalError};
pub use types::*;

use config::MasterConfig;
use discovery::InMemoryDiscovery;
use std::sync::Arc;
use tracing::{error, info};

/// Run a Shoal master node with the given configuration.
pub async fn run(config: MasterConfig) -> Result<()> {
    info!("Starting Shoal master: {}", config.node.name);

    observability::init(&config.observability)?;
    std::fs::create_dir_all(&config.storage.metadata_dir)?;

    if config.observability.metrics_enabled {
        let obs_config = config.observability.clone();
        tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // The in-process store keeps the leader key and followers directory
    // for single-machine deployments; production deployments plug an
    // external backend into the same trait.
    let discovery = Arc::new(InMemoryDiscovery::new());

    let server = tokio::spawn(master::server::run_master_server(config, discovery));

    tokio::select! {
        result = server => match result {
            Ok(result) => result,
            Err(e) => Err(ShoalError::Internal(format!("master server panicked: {e}"))),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down Shoal master");
            Ok(())
        }
    }
}
