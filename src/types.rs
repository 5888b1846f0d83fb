//! Core type definitions for the Shoal metadata master.
//!
//! This module contains the fundamental data types used throughout Shoal:
//! identifiers for file nodes, chunks, and data nodes, the data-node status
//! ladder, and the chunk-transfer bookkeeping types exchanged with
//! chunkservers over heartbeats.
//!
//! # Key Types
//!
//! - [`ChunkId`]: `<fileNodeId>_<index>` identifier of one replication unit
//! - [`Chunk`]: committed and pending replica sets of a chunk
//! - [`DataNode`]: catalog record of a chunkserver
//! - [`ChunkSendInfo`]: one planned or reported chunk transfer
//!
//! # Type Aliases
//!
//! - [`NodeId`] = `u64`: master replica identifier (raft)
//! - [`Term`] = `u64`: raft term number
//! - [`LogIndex`] = `u64`: raft log position

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a master replica in the raft group.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Unique identifier for a node in the directory tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FileNodeId(pub Uuid);

impl FileNodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileNodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileNodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a data node (chunkserver).
///
/// Ids are minted once at registration and never reused: a node that dies
/// and restarts registers under a fresh id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DataNodeId(pub Uuid);

impl DataNodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DataNodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DataNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DataNodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of one chunk: the owning file node plus the chunk index
/// within the file. Rendered as `<fileNodeId>_<index>`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChunkId {
    pub file: FileNodeId,
    pub index: u32,
}

impl ChunkId {
    pub fn new(file: FileNodeId, index: u32) -> Self {
        Self { file, index }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.file, self.index)
    }
}

impl FromStr for ChunkId {
    type Err = crate::error::ShoalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, index) = s.rsplit_once('_').ok_or_else(|| {
            crate::error::ShoalError::SnapshotFormat(format!("bad chunk id: {s}"))
        })?;
        let file = FileNodeId::from_str(file).map_err(|e| {
            crate::error::ShoalError::SnapshotFormat(format!("bad chunk id {s}: {e}"))
        })?;
        let index = index.parse::<u32>().map_err(|e| {
            crate::error::ShoalError::SnapshotFormat(format!("bad chunk index {s}: {e}"))
        })?;
        Ok(Self { file, index })
    }
}

/// Liveness status of a data node.
///
/// Transitions are `Alive -> Waiting -> Dead`, or `Waiting -> Alive` on a
/// fresh heartbeat. Dead nodes are removed from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataNodeStatus {
    Alive,
    Waiting,
    Dead,
}

impl DataNodeStatus {
    /// Numeric code used by the snapshot text format.
    pub fn code(&self) -> u8 {
        match self {
            DataNodeStatus::Alive => 0,
            DataNodeStatus::Waiting => 1,
            DataNodeStatus::Dead => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DataNodeStatus::Alive),
            1 => Some(DataNodeStatus::Waiting),
            2 => Some(DataNodeStatus::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for DataNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataNodeStatus::Alive => write!(f, "Alive"),
            DataNodeStatus::Waiting => write!(f, "Waiting"),
            DataNodeStatus::Dead => write!(f, "Dead"),
        }
    }
}

/// How a chunk travels between data nodes.
///
/// `Copy` adds a replica; `Move` adds a replica on the receiver and retires
/// the sender's copy once the transfer is confirmed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum SendType {
    Copy,
    Move,
}

/// State of one entry in a data node's outbound transfer plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStage {
    /// Planned, not yet handed to the sender.
    WaitToInform,
    /// Handed to the sender in a heartbeat response; awaiting confirmation.
    WaitToSend,
}

/// One chunk transfer: planned on a sender, or reported back by a
/// heartbeat's success/fail lists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ChunkSendInfo {
    pub chunk_id: ChunkId,
    /// The receiving data node.
    pub receiver: DataNodeId,
    pub send_type: SendType,
}

/// Target stage of a liveness demotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradeStage {
    /// Alive -> Waiting: the node keeps its catalog entry and replicas.
    Waiting,
    /// Waiting -> Dead: the node is dropped and its chunks re-replicated.
    Dead,
}

/// Read-consistency mode carried by read commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// Must be served by the leader.
    Latest,
    /// May be served by a follower; may lag the leader.
    Stale,
}

/// A chunk's replica bookkeeping.
///
/// `committed` holds data nodes that confirmed storage via heartbeat;
/// `pending` holds nodes assigned by the planner that have not confirmed
/// yet. The sets are disjoint after every apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub committed: BTreeSet<DataNodeId>,
    pub pending: BTreeSet<DataNodeId>,
}

impl Chunk {
    pub fn new(id: ChunkId) -> Self {
        Self {
            id,
            committed: BTreeSet::new(),
            pending: BTreeSet::new(),
        }
    }

    /// Count of nodes that hold or are assigned to hold this chunk.
    pub fn replica_count(&self) -> usize {
        self.committed.len() + self.pending.len()
    }

    pub fn is_under_replicated(&self, replica_num: usize) -> bool {
        self.replica_count() < replica_num
    }

    /// True if the given node holds or is assigned this chunk.
    pub fn stores(&self, node: &DataNodeId) -> bool {
        self.committed.contains(node) || self.pending.contains(node)
    }
}

/// Catalog record of a data node (chunkserver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataNode {
    pub id: DataNodeId,
    pub status: DataNodeStatus,
    /// Network address the chunkserver accepts transfers on.
    pub address: String,
    /// All chunk ids this node claims to hold.
    pub chunks: BTreeSet<ChunkId>,
    /// Advisory I/O load, refreshed by heartbeats with a few seconds of lag.
    pub io_load: u32,
    /// Outbound transfers this node should perform, and their stage.
    pub transfer_plan: BTreeMap<ChunkSendInfo, TransferStage>,
    /// When the most recent heartbeat was received.
    pub last_heartbeat: DateTime<Utc>,
}

impl DataNode {
    pub fn new(id: DataNodeId, address: String, registered_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: DataNodeStatus::Alive,
            address,
            chunks: BTreeSet::new(),
            io_load: 0,
            transfer_plan: BTreeMap::new(),
            last_heartbeat: registered_at,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == DataNodeStatus::Alive
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
