//! Raft consensus for the Shoal master replica group.
//!
//! Every mutation of the master state travels through this module as a log
//! command; apply handlers on each replica see the same totally ordered
//! sequence. The node publishes its leadership state on a watch channel so
//! the master can scope its background controllers to the current term.

// unwrap() panics here can break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod log;
mod node;
pub mod rpc;
mod state;
mod storage;

pub use log::{LogEntry, RaftLog};
pub use node::{RaftCommand, RaftConfig, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, NoopRpc, RaftMessage, RaftRpc, RequestVoteRequest,
    RequestVoteResponse,
};
pub use state::{NodeState, PersistentState, RaftState};
pub use storage::{RaftStorage, SnapshotMeta};

use crate::types::{NodeId, Term};

/// Trait for state machines driven by the raft log.
pub trait StateMachine: Send + Sync {
    /// The result type of applying one command.
    type Result: Send + Clone;

    /// Apply a committed command. Must be deterministic.
    fn apply(&mut self, command: &[u8]) -> Self::Result;

    /// Serialize the current state.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the current state from a snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> crate::Result<()>;
}

/// Leadership as observed by one node, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipState {
    pub term: Term,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
}

impl LeadershipState {
    pub fn unknown() -> Self {
        Self {
            term: 0,
            is_leader: false,
            leader_id: None,
        }
    }
}
