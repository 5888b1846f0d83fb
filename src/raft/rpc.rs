//! Raft RPC message definitions and the transport trait.

use super::LogEntry;
use crate::error::{Result, ShoalError};
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// All raft wire messages, tagged for transports that multiplex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    /// Empty for a pure heartbeat.
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index now replicated on the follower.
    pub match_index: LogIndex,
    /// Retry hint: first index of the conflicting term, if any.
    pub conflict_index: Option<LogIndex>,
}

/// Whole-snapshot transfer for a follower too far behind the compacted log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up to and including this index.
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub installed: bool,
}

/// Transport between raft peers.
#[async_trait::async_trait]
pub trait RaftRpc: Send + Sync {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// Transport for a single-node group: there are no peers to reach, so
/// every call is an error. Useful for standalone masters and tests.
pub struct NoopRpc;

#[async_trait::async_trait]
impl RaftRpc for NoopRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        _request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        Err(ShoalError::PeerNotFound(target))
    }

    async fn append_entries(
        &self,
        target: NodeId,
        _request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        Err(ShoalError::PeerNotFound(target))
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        _request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        Err(ShoalError::PeerNotFound(target))
    }
}
