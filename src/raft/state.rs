//! Raft node role and term bookkeeping.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a node in the replica group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// State that must survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Per-follower replication progress, leader only.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next log index to send to each peer.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest index known replicated on each peer.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let next_index = peers.iter().map(|&p| (p, last_log_index + 1)).collect();
        let match_index = peers.iter().map(|&p| (p, 0)).collect();
        Self {
            next_index,
            match_index,
        }
    }

    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        self.match_index.insert(peer, match_index);
        self.next_index.insert(peer, match_index + 1);
    }

    pub fn decrement_next(&mut self, peer: NodeId) {
        if let Some(next) = self.next_index.get_mut(&peer) {
            *next = next.saturating_sub(1).max(1);
        }
    }
}

/// Complete volatile+persistent raft state of one node.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: NodeId,
    pub state: NodeState,
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// Only populated while leader.
    pub leader: Option<LeaderState>,
    pub peers: Vec<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node_id,
            state: NodeState::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            commit_index: 0,
            last_applied: 0,
            leader: None,
            peers,
        }
    }

    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.persistent.current_term = term;
        self.leader_id = leader_id;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term,
            leader = ?leader_id,
            "became follower"
        );
    }

    pub fn become_candidate(&mut self) {
        self.state = NodeState::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became candidate"
        );
    }

    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(&self.peers, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became leader"
        );
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Majority size for the replica group (self included).
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Highest index replicated on a majority, never below the current
    /// commit index.
    pub fn calculate_commit_index(&self, last_log_index: LogIndex) -> LogIndex {
        let leader = match (&self.leader, self.is_leader()) {
            (Some(l), true) => l,
            _ => return self.commit_index,
        };

        let mut indices: Vec<LogIndex> = leader.match_index.values().copied().collect();
        indices.push(last_log_index);
        indices.sort_unstable();
        indices.reverse();

        let quorum_idx = self.quorum_size() - 1;
        if quorum_idx < indices.len() {
            indices[quorum_idx].max(self.commit_index)
        } else {
            self.commit_index
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_initial_state() {
        let state = RaftState::new(1, vec![2, 3]);
        assert_eq!(state.state, NodeState::Follower);
        assert_eq!(state.current_term(), 0);
        assert!(state.leader_id.is_none());
    }

    #[test]
    fn test_candidate_votes_for_self() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.persistent.voted_for, Some(1));
    }

    #[test]
    fn test_higher_term_resets_vote() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        state.become_follower(5, Some(2));
        assert!(state.persistent.voted_for.is_none());
        assert_eq!(state.current_term(), 5);
    }

    #[test]
    fn test_become_leader_initializes_progress() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        state.become_leader(5);

        let leader = state.leader.as_ref().unwrap();
        assert_eq!(leader.next_index[&2], 6);
        assert_eq!(leader.match_index[&2], 0);
    }

    #[test]
    fn test_quorum_size() {
        assert_eq!(RaftState::new(1, vec![]).quorum_size(), 1);
        assert_eq!(RaftState::new(1, vec![2, 3]).quorum_size(), 2);
        assert_eq!(RaftState::new(1, vec![2, 3, 4, 5]).quorum_size(), 3);
    }

    #[test]
    fn test_commit_index_needs_majority() {
        let mut state = RaftState::new(1, vec![2, 3, 4, 5]);
        state.become_candidate();
        state.become_leader(10);

        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 8);
        leader.match_index.insert(3, 7);
        leader.match_index.insert(4, 9);
        leader.match_index.insert(5, 6);

        // Indices [10, 9, 8, 7, 6]; the third highest is the quorum point.
        assert_eq!(state.calculate_commit_index(10), 8);
    }

    #[test]
    fn test_single_node_commits_immediately() {
        let mut state = RaftState::new(1, vec![]);
        state.become_candidate();
        state.become_leader(3);
        assert_eq!(state.calculate_commit_index(4), 4);
    }
}
