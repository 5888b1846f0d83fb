//! Shared helpers for integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shoal::config::ReplicationConfig;
use shoal::error::Result;
use shoal::master::tasks::CommandSink;
use shoal::master::{MasterOp, MasterState, OpResult};
use shoal::namespace::FileNode;
use shoal::types::{ChunkId, ChunkSendInfo, DataNodeId, DegradeStage, FileNodeId};
use std::sync::Arc;
use uuid::Uuid;

pub const MB: u64 = 1024 * 1024;

/// Applies commands straight to one replica's state, bypassing consensus.
/// Integration tests that need real consensus build a raft node instead.
pub struct DirectLog(pub Arc<MasterState>);

#[async_trait]
impl CommandSink for DirectLog {
    async fn submit(&self, op: MasterOp) -> Result<OpResult> {
        Ok(self.0.apply_op(op))
    }
}

pub fn replication_config() -> ReplicationConfig {
    ReplicationConfig {
        replica_num: 3,
        chunk_size: 64 * MB,
        ..Default::default()
    }
}

pub fn test_state() -> Arc<MasterState> {
    Arc::new(MasterState::new(replication_config()))
}

pub fn register_at(state: &MasterState, address: &str, at: DateTime<Utc>) -> DataNodeId {
    let id = DataNodeId::new();
    let result = state.apply_op(MasterOp::RegisterDataNode {
        op_id: Uuid::new_v4(),
        node_id: id,
        address: address.into(),
        registered_at: at,
    });
    assert!(result.is_success());
    id
}

pub fn register(state: &MasterState, address: &str) -> DataNodeId {
    register_at(state, address, Utc::now())
}

pub fn add_file(
    state: &MasterState,
    parent: &str,
    name: &str,
    size: u64,
    targets: Vec<DataNodeId>,
) -> FileNode {
    state
        .apply_op(MasterOp::AddFileNode {
            op_id: Uuid::new_v4(),
            parent_path: parent.into(),
            name: name.into(),
            size,
            is_file: true,
            node_id: FileNodeId::new(),
            targets,
        })
        .node()
        .expect("add_file should succeed")
}

pub fn add_dir(state: &MasterState, parent: &str, name: &str) -> FileNode {
    state
        .apply_op(MasterOp::AddFileNode {
            op_id: Uuid::new_v4(),
            parent_path: parent.into(),
            name: name.into(),
            size: 0,
            is_file: false,
            node_id: FileNodeId::new(),
            targets: vec![],
        })
        .node()
        .expect("add_dir should succeed")
}

pub fn heartbeat(state: &MasterState, node: DataNodeId, claimed: Vec<ChunkId>) -> OpResult {
    heartbeat_full(state, node, claimed, vec![], vec![])
}

pub fn heartbeat_full(
    state: &MasterState,
    node: DataNodeId,
    claimed: Vec<ChunkId>,
    successes: Vec<ChunkSendInfo>,
    failures: Vec<ChunkSendInfo>,
) -> OpResult {
    state.apply_op(MasterOp::Heartbeat {
        op_id: Uuid::new_v4(),
        node_id: node,
        address: "addr".into(),
        io_load: 0,
        chunk_ids: claimed,
        successes,
        failures,
        invalid_chunk_ids: vec![],
        at: Utc::now(),
    })
}

pub fn degrade(state: &MasterState, node: DataNodeId, stage: DegradeStage) {
    let result = state.apply_op(MasterOp::Degrade {
        op_id: Uuid::new_v4(),
        node_id: node,
        stage,
    });
    assert!(result.is_success());
}

/// Deep equality of two replicas' full state.
pub fn assert_states_equal(a: &MasterState, b: &MasterState) {
    assert_eq!(a.tree.export_preorder(), b.tree.export_preorder());
    assert_eq!(a.chunks.export(), b.chunks.export());
    assert_eq!(a.nodes.export(), b.nodes.export());
    assert_eq!(a.queue.export(), b.queue.export());
}
