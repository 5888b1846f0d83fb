//! Error types for the Shoal metadata master.
//!
//! This module provides a unified error type [`ShoalError`] for all master
//! operations, along with a convenient [`Result`] type alias.
//!
//! Errors fall into a few families:
//!
//! - **Namespace**: path resolution and name collisions
//! - **Consensus**: leadership, log replication, and apply deadlines
//! - **Cluster**: data-node shortage and transient data-node failures
//! - **Infrastructure**: storage, network, serialization, configuration

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// Main error type for Shoal operations.
#[derive(Error, Debug)]
pub enum ShoalError {
    // Namespace errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // Consensus errors
    #[error("Not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("Log apply exceeded its deadline: {0}")]
    ApplyTimeout(String),

    #[error("Raft log error: {0}")]
    RaftLog(String),

    #[error("Raft consensus failed: {0}")]
    RaftConsensus(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),

    // Cluster errors
    #[error("Degraded: {0}")]
    Degraded(String),

    #[error("Transient data-node failure: {0}")]
    Transient(String),

    #[error("Data node not registered: {0}")]
    DataNodeNotFound(String),

    // Infrastructure errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Snapshot format error: {0}")]
    SnapshotFormat(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShoalError {
    /// Check if the error is retryable by the caller.
    ///
    /// `ApplyTimeout` is retryable because every mutating command carries a
    /// unique id and apply handlers dedupe on it; the command may still
    /// commit after the deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShoalError::NotLeader { .. }
                | ShoalError::ApplyTimeout(_)
                | ShoalError::Transient(_)
                | ShoalError::Network(_)
        )
    }
}

impl From<rocksdb::Error> for ShoalError {
    fn from(e: rocksdb::Error) -> Self {
        ShoalError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for ShoalError {
    fn from(e: bincode::Error) -> Self {
        ShoalError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ShoalError {
    fn from(e: serde_json::Error) -> Self {
        ShoalError::Serialization(e.to_string())
    }
}

/// Result type alias for Shoal operations.
pub type Result<T> = std::result::Result<T, ShoalError>;
