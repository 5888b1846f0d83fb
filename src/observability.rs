//! Observability for the Shoal master: logging and metrics.

use crate::config::ObservabilityConfig;
use crate::error::{Result, ShoalError};
use metrics::{counter, gauge};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize observability (logging and metrics).
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ShoalError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| ShoalError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| ShoalError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| ShoalError::Network(e.to_string()))?;

    Ok(())
}

/// Register standard metrics.
fn register_metrics() {
    // Cluster metrics
    gauge!("shoal_datanodes_total").set(0.0);
    gauge!("shoal_datanodes_alive").set(0.0);
    gauge!("shoal_under_replicated_queue_len").set(0.0);

    // Raft metrics
    gauge!("shoal_raft_term").set(0.0);
    gauge!("shoal_raft_commit_index").set(0.0);
    counter!("shoal_raft_elections_total").absolute(0);
    counter!("shoal_raft_proposals_total").absolute(0);

    // Metadata metrics
    gauge!("shoal_file_nodes_total").set(0.0);
    gauge!("shoal_chunks_total").set(0.0);
    counter!("shoal_master_ops_total").absolute(0);
    counter!("shoal_repair_batches_total").absolute(0);
}

/// Record an applied master operation.
pub fn record_master_op(op_type: &str) {
    counter!("shoal_master_ops_total", "type" => op_type.to_string()).increment(1);
}

/// Record one repair batch submitted to the log.
pub fn record_repair_batch(chunks: usize) {
    counter!("shoal_repair_batches_total").increment(1);
    gauge!("shoal_repair_last_batch_size").set(chunks as f64);
}

/// Adjust the live data-node gauge.
pub fn set_alive_datanodes(count: usize) {
    gauge!("shoal_datanodes_alive").set(count as f64);
}
