//! Leader-only background controllers.
//!
//! Both controllers are spawned when this node wins an election and are
//! cancelled through a broadcast shutdown channel when the term ends, so
//! no task outlives the leadership that created it. Every state change
//! they decide on is submitted through the replicated log; the controllers
//! themselves never mutate catalogs directly.

use super::ops::{MasterOp, OpResult};
use super::state::MasterState;
use crate::config::ReplicationConfig;
use crate::discovery::{DiscoveryStore, PeerEvent};
use crate::error::Result;
use crate::observability;
use crate::placement::PlacementPlanner;
use crate::types::DegradeStage;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where controllers submit commands: the replicated log on a real
/// deployment, a direct apply in tests.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn submit(&self, op: MasterOp) -> Result<OpResult>;
}

/// Periodic scan that walks every data node down the status ladder as its
/// heartbeats go silent.
pub struct LivenessController {
    state: Arc<MasterState>,
    sink: Arc<dyn CommandSink>,
    config: ReplicationConfig,
}

impl LivenessController {
    pub fn new(
        state: Arc<MasterState>,
        sink: Arc<dyn CommandSink>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            state,
            sink,
            config,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.master_check_time);
        info!("liveness controller starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scan().await,
                _ = shutdown.recv() => {
                    info!("liveness controller shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over the catalog. Demotions go through the log so every
    /// replica converges on the same status ladder.
    pub async fn scan(&self) {
        let now = Utc::now();
        let waiting_after = chrono::Duration::from_std(self.config.waiting_threshold())
            .unwrap_or(chrono::Duration::MAX);
        let dead_after = chrono::Duration::from_std(self.config.chunk_die_time)
            .unwrap_or(chrono::Duration::MAX);

        for node in self.state.nodes.export() {
            let silent = now - node.last_heartbeat;
            let stage = match node.status {
                crate::types::DataNodeStatus::Alive if silent > waiting_after => {
                    DegradeStage::Waiting
                }
                crate::types::DataNodeStatus::Waiting if silent > dead_after => {
                    DegradeStage::Dead
                }
                _ => continue,
            };

            let op = MasterOp::Degrade {
                op_id: Uuid::new_v4(),
                node_id: node.id,
                stage,
            };
            if let Err(e) = self.sink.submit(op).await {
                warn!(node = %node.id, ?stage, error = %e, "degrade submission failed");
            }
        }
        debug!("completed a liveness round");
    }
}

/// Drains the under-replication queue through the planner.
///
/// Wakes on a timer or as soon as the queue reaches the repair batch
/// threshold. Queue entries are only popped inside the committed
/// `AllocateChunks` apply, so a failed submission leaves them for the
/// next wake.
pub struct RepairLoop {
    state: Arc<MasterState>,
    sink: Arc<dyn CommandSink>,
    config: ReplicationConfig,
}

impl RepairLoop {
    pub fn new(
        state: Arc<MasterState>,
        sink: Arc<dyn CommandSink>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            state,
            sink,
            config,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.dead_chunk_check_time);
        info!("repair loop starting");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.repair_once().await,
                _ = self.state.queue.threshold_reached() => self.repair_once().await,
                _ = shutdown.recv() => {
                    info!("repair loop shutting down");
                    break;
                }
            }
        }
    }

    /// Peek a batch, plan it, and submit the plan as one log command.
    pub async fn repair_once(&self) {
        if self.state.queue.is_empty() {
            return;
        }

        let batch = self
            .state
            .queue
            .batch_top(self.config.dead_chunk_copy_threshold);
        let filtered = self.state.chunks.batch_filter(&batch);
        let alive = self.state.nodes.alive_ids();
        if alive.is_empty() {
            warn!(queued = batch.len(), "no alive data nodes; repair degraded");
            return;
        }

        // The search is CPU-bound; keep it off the async executor.
        let is_store = self.state.chunks.store_state(&filtered, &alive);
        let search_nodes = alive.clone();
        let plan = match tokio::task::spawn_blocking(move || {
            PlacementPlanner::plan(&filtered, &search_nodes, &is_store)
        })
        .await
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "placement search did not complete");
                return;
            }
        };

        // Nothing placeable and nothing to clean out of the queue.
        if plan.is_empty() && plan.skipped.len() == batch.len() {
            return;
        }

        let planned = plan.chunk_ids.len();
        let op = MasterOp::AllocateChunks {
            op_id: Uuid::new_v4(),
            chunk_ids: plan.chunk_ids,
            node_ids: alive,
            receivers: plan.receivers,
            senders: plan.senders,
            batch_len: batch.len(),
            requeue: plan.skipped,
        };
        match self.sink.submit(op).await {
            Ok(_) => {
                observability::record_repair_batch(planned);
                info!(planned, batch = batch.len(), "repair batch committed");
            }
            Err(e) => {
                // Entries were never popped; the next wake retries.
                warn!(error = %e, "repair batch submission failed");
            }
        }
    }
}

/// Leader-side observer of peer-state changes: peers the discovery
/// backend reports as failed are evicted from the followers directory.
pub struct PeerObserver {
    discovery: Arc<dyn DiscoveryStore>,
}

impl PeerObserver {
    pub fn new(discovery: Arc<dyn DiscoveryStore>) -> Self {
        Self { discovery }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.discovery.watch_peers();
        info!("peer observer starting");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PeerEvent::Failed(peer)) => {
                        warn!(peer, "peer observed as failed; evicting from followers");
                        if let Err(e) = self.discovery.unregister_follower(peer).await {
                            warn!(peer, error = %e, "failed to evict peer");
                        }
                    }
                    Ok(PeerEvent::Joined(peer)) => {
                        debug!(peer, "peer joined");
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => {
                    info!("peer observer shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkId, DataNodeId, DataNodeStatus, FileNodeId};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    /// Applies commands straight to the state, bypassing consensus.
    struct DirectSink(Arc<MasterState>);

    #[async_trait]
    impl CommandSink for DirectSink {
        async fn submit(&self, op: MasterOp) -> Result<OpResult> {
            Ok(self.0.apply_op(op))
        }
    }

    fn quick_config() -> ReplicationConfig {
        ReplicationConfig {
            chunk_heartbeat_time: Duration::from_secs(10),
            chunk_waiting_time: 3,
            chunk_die_time: Duration::from_secs(600),
            dead_chunk_copy_threshold: 10,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<MasterState>, Arc<dyn CommandSink>, ReplicationConfig) {
        let config = quick_config();
        let state = Arc::new(MasterState::new(config.clone()));
        let sink: Arc<dyn CommandSink> = Arc::new(DirectSink(Arc::clone(&state)));
        (state, sink, config)
    }

    fn register_at(state: &MasterState, silent_for: ChronoDuration) -> DataNodeId {
        let id = DataNodeId::new();
        state.apply_op(MasterOp::RegisterDataNode {
            op_id: Uuid::new_v4(),
            node_id: id,
            address: "addr".into(),
            registered_at: Utc::now() - silent_for,
        });
        id
    }

    #[tokio::test]
    async fn test_silent_alive_node_goes_waiting() {
        let (state, sink, config) = setup();
        let fresh = register_at(&state, ChronoDuration::zero());
        let silent = register_at(&state, ChronoDuration::seconds(60));

        LivenessController::new(Arc::clone(&state), sink, config)
            .scan()
            .await;

        assert_eq!(state.nodes.get(fresh).unwrap().status, DataNodeStatus::Alive);
        assert_eq!(
            state.nodes.get(silent).unwrap().status,
            DataNodeStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_silent_waiting_node_goes_dead() {
        let (state, sink, config) = setup();
        let doomed = register_at(&state, ChronoDuration::seconds(700));

        let controller = LivenessController::new(Arc::clone(&state), sink, config);
        controller.scan().await; // Alive -> Waiting
        assert_eq!(
            state.nodes.get(doomed).unwrap().status,
            DataNodeStatus::Waiting
        );
        controller.scan().await; // Waiting -> Dead
        assert!(!state.nodes.contains(doomed));
    }

    #[tokio::test]
    async fn test_repair_plans_queued_chunk() {
        let (state, sink, config) = setup();
        let holder = register_at(&state, ChronoDuration::zero());
        let receiver = register_at(&state, ChronoDuration::zero());

        // A file whose single chunk is held by one node only.
        let file = state
            .apply_op(MasterOp::AddFileNode {
                op_id: Uuid::new_v4(),
                parent_path: "/".into(),
                name: "x".into(),
                size: 1,
                is_file: true,
                node_id: FileNodeId::new(),
                targets: vec![holder],
            })
            .node()
            .unwrap();
        let chunk: ChunkId = file.chunks[0];
        state.apply_op(MasterOp::Heartbeat {
            op_id: Uuid::new_v4(),
            node_id: holder,
            address: "addr".into(),
            io_load: 0,
            chunk_ids: vec![chunk],
            successes: vec![],
            failures: vec![],
            invalid_chunk_ids: vec![],
            at: Utc::now(),
        });
        assert_eq!(state.queue.occurrences(chunk), 2);

        RepairLoop::new(Arc::clone(&state), sink, config)
            .repair_once()
            .await;

        // One new pending replica was planned on the other node; the
        // second missing replica had no eligible receiver and stays
        // queued.
        let chunk_state = state.chunks.get(chunk).unwrap();
        assert!(chunk_state.pending.contains(&receiver));
        assert_eq!(state.queue.occurrences(chunk), 1);
        let holder_plan = &state.nodes.get(holder).unwrap().transfer_plan;
        assert_eq!(holder_plan.len(), 1);
    }

    #[tokio::test]
    async fn test_repair_with_no_nodes_leaves_queue() {
        let (state, sink, config) = setup();
        let file = state
            .apply_op(MasterOp::AddFileNode {
                op_id: Uuid::new_v4(),
                parent_path: "/".into(),
                name: "x".into(),
                size: 1,
                is_file: true,
                node_id: FileNodeId::new(),
                targets: vec![],
            })
            .node()
            .unwrap();
        let queued = state.queue.occurrences(file.chunks[0]);
        assert!(queued > 0);

        RepairLoop::new(Arc::clone(&state), sink, config)
            .repair_once()
            .await;

        assert_eq!(state.queue.occurrences(file.chunks[0]), queued);
    }

    #[tokio::test]
    async fn test_repair_cleans_satisfied_entries() {
        let (state, sink, config) = setup();
        register_at(&state, ChronoDuration::zero());
        let targets: Vec<DataNodeId> = (0..3)
            .map(|_| register_at(&state, ChronoDuration::zero()))
            .collect();
        // Short allocation queues a deficit, then the missing replicas
        // are satisfied by later target heartbeats claiming the chunk.
        let file = state
            .apply_op(MasterOp::AddFileNode {
                op_id: Uuid::new_v4(),
                parent_path: "/".into(),
                name: "x".into(),
                size: 1,
                is_file: true,
                node_id: FileNodeId::new(),
                targets: targets[..1].to_vec(),
            })
            .node()
            .unwrap();
        let chunk = file.chunks[0];
        for target in &targets {
            state.apply_op(MasterOp::Heartbeat {
                op_id: Uuid::new_v4(),
                node_id: *target,
                address: "addr".into(),
                io_load: 0,
                chunk_ids: vec![chunk],
                successes: vec![],
                failures: vec![],
                invalid_chunk_ids: vec![],
                at: Utc::now(),
            });
        }
        assert_eq!(state.queue.occurrences(chunk), 2);

        RepairLoop::new(Arc::clone(&state), sink, config)
            .repair_once()
            .await;

        // The chunk is fully replicated; stale queue entries are gone.
        assert_eq!(state.queue.occurrences(chunk), 0);
    }
}
