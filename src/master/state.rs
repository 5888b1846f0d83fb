//! The replicated master state and its deterministic apply handlers.

use super::ops::{MasterOp, OpResult};
use super::snapshot;
use crate::catalog::{ChunkCatalog, DataNodeCatalog, UnderReplicationQueue};
use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::namespace::PathTree;
use crate::observability;
use crate::raft::StateMachine;
use crate::types::{ChunkId, ChunkSendInfo, DataNodeId, DegradeStage, SendType};
use metrics::gauge;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// How many applied op ids (and their results) are remembered for dedupe.
const APPLIED_OP_MEMORY: usize = 4096;

/// Remembered results of recently applied commands.
///
/// A command that commits after its submitter gave up may be submitted
/// again under the same op id; the remembered result makes the second
/// apply a no-op that answers identically.
struct AppliedOps {
    results: HashMap<Uuid, OpResult>,
    order: VecDeque<Uuid>,
}

impl AppliedOps {
    fn new() -> Self {
        Self {
            results: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, op_id: &Uuid) -> Option<OpResult> {
        self.results.get(op_id).cloned()
    }

    fn insert(&mut self, op_id: Uuid, result: OpResult) {
        if self.results.insert(op_id, result).is_none() {
            self.order.push_back(op_id);
            if self.order.len() > APPLIED_OP_MEMORY {
                if let Some(evicted) = self.order.pop_front() {
                    self.results.remove(&evicted);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.results.clear();
        self.order.clear();
    }
}

/// All replicated master state: the directory tree, the chunk catalog, the
/// data-node catalog, and the under-replication queue.
///
/// Constructed once at startup and passed explicitly to handlers and
/// background tasks. Handlers that touch more than one catalog do so in
/// the fixed order *tree -> chunks -> nodes*.
pub struct MasterState {
    pub tree: PathTree,
    pub chunks: ChunkCatalog,
    pub nodes: DataNodeCatalog,
    pub queue: Arc<UnderReplicationQueue>,
    pub replication: ReplicationConfig,
    applied: Mutex<AppliedOps>,
}

impl MasterState {
    pub fn new(replication: ReplicationConfig) -> Self {
        let queue = Arc::new(UnderReplicationQueue::new(
            replication.dead_chunk_copy_threshold,
        ));
        Self {
            tree: PathTree::new(replication.chunk_size),
            chunks: ChunkCatalog::new(replication.replica_num, Arc::clone(&queue)),
            nodes: DataNodeCatalog::new(),
            queue,
            replication,
            applied: Mutex::new(AppliedOps::new()),
        }
    }

    /// Apply one committed command. Deterministic: identical command
    /// sequences produce identical state on every replica.
    pub fn apply_op(&self, op: MasterOp) -> OpResult {
        let op_id = op.op_id();
        if let Some(prev) = self.applied.lock().get(&op_id) {
            debug!(op = op.kind(), %op_id, "skipping duplicate command");
            return prev;
        }
        observability::record_master_op(op.kind());

        let result = match op {
            MasterOp::AddFileNode {
                parent_path,
                name,
                size,
                is_file,
                node_id,
                targets,
                ..
            } => self.add_file_node(&parent_path, &name, size, is_file, node_id, &targets),
            MasterOp::MoveFileNode {
                src_path,
                dst_parent_path,
                ..
            } => match self.tree.move_node(&src_path, &dst_parent_path) {
                Ok(node) => OpResult::Node(node),
                Err(e) => OpResult::from_err(&e),
            },
            MasterOp::RemoveFileNode {
                path, deleted_at, ..
            } => match self.tree.remove(&path, deleted_at) {
                Ok(node) => OpResult::Node(node),
                Err(e) => OpResult::from_err(&e),
            },
            MasterOp::RenameFileNode { path, new_name, .. } => {
                match self.tree.rename(&path, &new_name) {
                    Ok(node) => OpResult::Node(node),
                    Err(e) => OpResult::from_err(&e),
                }
            }
            MasterOp::RegisterDataNode {
                node_id,
                address,
                registered_at,
                ..
            } => {
                self.nodes.register(node_id, &address, registered_at);
                OpResult::Registered { node_id }
            }
            MasterOp::Heartbeat {
                node_id,
                address,
                io_load,
                chunk_ids,
                successes,
                failures,
                invalid_chunk_ids,
                at,
                ..
            } => self.heartbeat(
                node_id,
                &address,
                io_load,
                &chunk_ids,
                &successes,
                &failures,
                &invalid_chunk_ids,
                at,
            ),
            MasterOp::Degrade { node_id, stage, .. } => self.degrade(node_id, stage),
            MasterOp::AllocateChunks {
                chunk_ids,
                node_ids,
                receivers,
                senders,
                batch_len,
                requeue,
                ..
            } => self.allocate_chunks(
                &chunk_ids, &node_ids, &receivers, &senders, batch_len, &requeue,
            ),
        };

        self.applied.lock().insert(op_id, result.clone());
        self.update_gauges();
        result
    }

    fn add_file_node(
        &self,
        parent_path: &str,
        name: &str,
        size: u64,
        is_file: bool,
        node_id: crate::types::FileNodeId,
        targets: &[DataNodeId],
    ) -> OpResult {
        let node = match self.tree.add(parent_path, name, size, is_file, node_id) {
            Ok(node) => node,
            Err(e) => return OpResult::from_err(&e),
        };
        if is_file {
            self.chunks.create_for_file(&node.chunks, targets);
        }
        debug!(node = %node.id, parent = parent_path, name, "file node added");
        OpResult::Node(node)
    }

    #[allow(clippy::too_many_arguments)]
    fn heartbeat(
        &self,
        node_id: DataNodeId,
        address: &str,
        io_load: u32,
        chunk_ids: &[ChunkId],
        successes: &[ChunkSendInfo],
        failures: &[ChunkSendInfo],
        invalid_chunk_ids: &[ChunkId],
        at: chrono::DateTime<chrono::Utc>,
    ) -> OpResult {
        // A heartbeat from a node the catalog dropped (or never saw) is a
        // fresh registration.
        if !self.nodes.contains(node_id) {
            self.nodes.register(node_id, address, at);
        }

        self.chunks.confirm_claims(node_id, chunk_ids);
        self.chunks.confirm_transfers(node_id, successes, failures);
        if !invalid_chunk_ids.is_empty() {
            self.chunks.remove_replica_on(node_id, invalid_chunk_ids);
        }

        let orders = self
            .nodes
            .absorb_heartbeat(node_id, io_load, chunk_ids, successes, failures, at)
            .unwrap_or_default();
        self.nodes.batch_add_chunks(successes);
        if !invalid_chunk_ids.is_empty() {
            self.nodes.remove_chunks(node_id, invalid_chunk_ids);
        }

        OpResult::TransferOrders(orders)
    }

    fn degrade(&self, node_id: DataNodeId, stage: DegradeStage) -> OpResult {
        match stage {
            DegradeStage::Waiting => {
                self.nodes.degrade(node_id, stage);
            }
            DegradeStage::Dead => {
                if let Some(dead) = self.nodes.degrade(node_id, stage) {
                    let held: Vec<ChunkId> = dead.chunks.iter().copied().collect();
                    self.chunks.remove_replica_on(dead.id, &held);
                    let transfers: Vec<ChunkSendInfo> =
                        dead.transfer_plan.keys().copied().collect();
                    self.chunks.abandon_transfers(&transfers);
                    warn!(
                        node = %node_id,
                        chunks = held.len(),
                        transfers = transfers.len(),
                        "dead data node shrunk out of the cluster"
                    );
                }
            }
        }
        OpResult::Success
    }

    fn allocate_chunks(
        &self,
        chunk_ids: &[ChunkId],
        node_ids: &[DataNodeId],
        receivers: &[usize],
        senders: &[usize],
        batch_len: usize,
        requeue: &[ChunkId],
    ) -> OpResult {
        if receivers.len() != chunk_ids.len()
            || senders.len() != chunk_ids.len()
            || receivers
                .iter()
                .chain(senders)
                .any(|&i| i >= node_ids.len())
        {
            return OpResult::Error {
                kind: super::ops::OpErrorKind::Internal,
                message: "malformed allocation plan".into(),
            };
        }

        // Pop exactly what the planning pass peeked, then give back the
        // entries it could not place.
        self.queue.batch_pop(batch_len);
        for id in requeue {
            self.queue.push(*id);
        }

        let receiver_assignments: Vec<(ChunkId, DataNodeId)> = chunk_ids
            .iter()
            .zip(receivers)
            .map(|(chunk, &r)| (*chunk, node_ids[r]))
            .collect();
        self.chunks.batch_apply_plan(&receiver_assignments);

        let sender_assignments: Vec<(DataNodeId, ChunkSendInfo)> = chunk_ids
            .iter()
            .zip(receivers.iter().zip(senders))
            .map(|(chunk, (&r, &s))| {
                (
                    node_ids[s],
                    ChunkSendInfo {
                        chunk_id: *chunk,
                        receiver: node_ids[r],
                        send_type: SendType::Copy,
                    },
                )
            })
            .collect();
        self.nodes.apply_sender_plan(&sender_assignments);

        OpResult::Allocated {
            planned: chunk_ids.len(),
        }
    }

    /// Replica addresses for a chunk, least-loaded holder first.
    pub fn chunk_replicas(&self, id: ChunkId) -> Result<Vec<(DataNodeId, String)>> {
        let chunk = self
            .chunks
            .get(id)
            .ok_or_else(|| crate::error::ShoalError::NotFound(id.to_string()))?;
        Ok(self.nodes.sorted_by_load(&chunk.committed))
    }

    /// Forget remembered op results (snapshot restore starts fresh; log
    /// replay repopulates the memory).
    pub(crate) fn reset_applied(&self) {
        self.applied.lock().clear();
    }

    fn update_gauges(&self) {
        gauge!("shoal_file_nodes_total").set(self.tree.len() as f64);
        gauge!("shoal_chunks_total").set(self.chunks.len() as f64);
        gauge!("shoal_under_replicated_queue_len").set(self.queue.len() as f64);
        gauge!("shoal_datanodes_total").set(self.nodes.len() as f64);
    }
}

/// Raft-facing wrapper around [`MasterState`].
pub struct MasterStateMachine {
    state: Arc<MasterState>,
}

impl MasterStateMachine {
    pub fn new(state: Arc<MasterState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<MasterState> {
        Arc::clone(&self.state)
    }
}

impl StateMachine for MasterStateMachine {
    type Result = OpResult;

    fn apply(&mut self, command: &[u8]) -> OpResult {
        match bincode::deserialize::<MasterOp>(command) {
            Ok(op) => self.state.apply_op(op),
            Err(e) => {
                warn!(error = %e, "undecodable command in the log");
                OpResult::Error {
                    kind: super::ops::OpErrorKind::Internal,
                    message: format!("undecodable command: {e}"),
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        snapshot::encode(&self.state)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        snapshot::decode(&self.state, bytes)?;
        self.state.reset_applied();
        Ok(())
    }
}
