//! Master operations replicated through the raft log.
//!
//! Apply handlers are deterministic: every datum a handler needs that is
//! not already replicated state rides in the command itself, including
//! freshly minted ids, wall-clock timestamps, and the full placement plan.
//! Every mutating command carries a unique `op_id` so handlers can dedupe
//! a command that commits after its submitter timed out and retried.

use crate::error::ShoalError;
use crate::namespace::FileNode;
use crate::types::{ChunkId, ChunkSendInfo, DataNodeId, DegradeStage, FileNodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands applied by the master state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasterOp {
    AddFileNode {
        op_id: Uuid,
        parent_path: String,
        name: String,
        size: u64,
        is_file: bool,
        /// Pre-assigned node id so retries and replicas converge.
        node_id: FileNodeId,
        /// Data nodes selected by the leader to hold the file's chunks.
        targets: Vec<DataNodeId>,
    },
    MoveFileNode {
        op_id: Uuid,
        src_path: String,
        dst_parent_path: String,
    },
    RemoveFileNode {
        op_id: Uuid,
        path: String,
        /// Deletion stamp; apply never reads the wall clock.
        deleted_at: DateTime<Utc>,
    },
    RenameFileNode {
        op_id: Uuid,
        path: String,
        new_name: String,
    },
    RegisterDataNode {
        op_id: Uuid,
        node_id: DataNodeId,
        address: String,
        registered_at: DateTime<Utc>,
    },
    Heartbeat {
        op_id: Uuid,
        node_id: DataNodeId,
        /// Carried so a heartbeat from a forgotten node re-registers it.
        address: String,
        io_load: u32,
        chunk_ids: Vec<ChunkId>,
        successes: Vec<ChunkSendInfo>,
        failures: Vec<ChunkSendInfo>,
        invalid_chunk_ids: Vec<ChunkId>,
        at: DateTime<Utc>,
    },
    Degrade {
        op_id: Uuid,
        node_id: DataNodeId,
        stage: DegradeStage,
    },
    /// Carries the full planner output so apply is identical on every
    /// replica.
    AllocateChunks {
        op_id: Uuid,
        chunk_ids: Vec<ChunkId>,
        node_ids: Vec<DataNodeId>,
        receivers: Vec<usize>,
        senders: Vec<usize>,
        /// How many queue entries the planning pass peeked; apply pops
        /// exactly this many.
        batch_len: usize,
        /// Peeked entries the planner could not place; pushed back.
        requeue: Vec<ChunkId>,
    },
}

impl MasterOp {
    pub fn op_id(&self) -> Uuid {
        match self {
            MasterOp::AddFileNode { op_id, .. }
            | MasterOp::MoveFileNode { op_id, .. }
            | MasterOp::RemoveFileNode { op_id, .. }
            | MasterOp::RenameFileNode { op_id, .. }
            | MasterOp::RegisterDataNode { op_id, .. }
            | MasterOp::Heartbeat { op_id, .. }
            | MasterOp::Degrade { op_id, .. }
            | MasterOp::AllocateChunks { op_id, .. } => *op_id,
        }
    }

    /// Short operation name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            MasterOp::AddFileNode { .. } => "add_file_node",
            MasterOp::MoveFileNode { .. } => "move_file_node",
            MasterOp::RemoveFileNode { .. } => "remove_file_node",
            MasterOp::RenameFileNode { .. } => "rename_file_node",
            MasterOp::RegisterDataNode { .. } => "register_data_node",
            MasterOp::Heartbeat { .. } => "heartbeat",
            MasterOp::Degrade { .. } => "degrade",
            MasterOp::AllocateChunks { .. } => "allocate_chunks",
        }
    }
}

/// Error kinds that survive the apply boundary back to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpErrorKind {
    NotFound,
    AlreadyExists,
    InvalidPath,
    Internal,
}

/// Result of applying a master operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpResult {
    /// The operation produced or mutated this tree node.
    Node(FileNode),
    /// A data node was (re-)registered.
    Registered { node_id: DataNodeId },
    /// Heartbeat response: transfers the node should start now.
    TransferOrders(Vec<ChunkSendInfo>),
    /// A placement batch was applied.
    Allocated { planned: usize },
    /// Operation completed with nothing to report.
    Success,
    /// Operation failed with an error.
    Error { kind: OpErrorKind, message: String },
}

impl OpResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, OpResult::Error { .. })
    }

    pub fn from_err(err: &ShoalError) -> Self {
        let kind = match err {
            ShoalError::NotFound(_) => OpErrorKind::NotFound,
            ShoalError::AlreadyExists(_) => OpErrorKind::AlreadyExists,
            ShoalError::InvalidPath(_) => OpErrorKind::InvalidPath,
            _ => OpErrorKind::Internal,
        };
        OpResult::Error {
            kind,
            message: err.to_string(),
        }
    }

    /// Convert back into a crate error at the RPC boundary.
    pub fn into_error(kind: OpErrorKind, message: String) -> ShoalError {
        match kind {
            OpErrorKind::NotFound => ShoalError::NotFound(message),
            OpErrorKind::AlreadyExists => ShoalError::AlreadyExists(message),
            OpErrorKind::InvalidPath => ShoalError::InvalidPath(message),
            OpErrorKind::Internal => ShoalError::Internal(message),
        }
    }

    pub fn node(self) -> Option<FileNode> {
        match self {
            OpResult::Node(node) => Some(node),
            _ => None,
        }
    }
}
