//! The raft node event loop.
//!
//! Beyond elections and log replication, the node carries two pieces the
//! master depends on:
//!
//! - **Apply waiters**: a proposer's response channel is parked keyed by
//!   the log index its entry received, and answered when that entry is
//!   applied. The caller enforces its own apply deadline; if leadership is
//!   lost before the entry commits, the waiter fails with `NotLeader`.
//! - **Leadership watch**: every role or term change is published on a
//!   `watch` channel so the master can start and cancel its term-scoped
//!   background controllers.

use super::rpc::*;
use super::state::*;
use super::{LeadershipState, LogEntry, RaftLog, RaftStorage, StateMachine};
use crate::error::{Result, ShoalError};
use crate::types::{LogIndex, NodeId, Term};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Raft tuning knobs.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: NodeId,
    /// Peer node ids and transport addresses.
    pub peers: HashMap<NodeId, String>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Max entries shipped per AppendEntries.
    pub max_entries_per_append: usize,
    /// Applied entries between snapshots.
    pub snapshot_threshold: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: HashMap::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_threshold: 10000,
        }
    }
}

/// Commands accepted by the node's event loop.
pub enum RaftCommand<R> {
    /// Replicate a command; the response fires once the entry is applied.
    Propose {
        data: Vec<u8>,
        response: oneshot::Sender<Result<R>>,
    },
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    Status {
        response: oneshot::Sender<LeadershipState>,
    },
    Shutdown,
}

type ApplyWaiters<R> = Mutex<HashMap<LogIndex, (Term, oneshot::Sender<Result<R>>)>>;

/// One raft replica driving a [`StateMachine`].
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    state: RwLock<RaftState>,
    log: RwLock<RaftLog>,
    storage: Arc<RaftStorage>,
    state_machine: RwLock<S>,
    rpc: Arc<dyn RaftRpc>,
    command_tx: mpsc::Sender<RaftCommand<S::Result>>,
    waiters: ApplyWaiters<S::Result>,
    leadership_tx: watch::Sender<LeadershipState>,
    snapshots_in_flight: Mutex<HashSet<NodeId>>,
}

impl<S: StateMachine + 'static> RaftNode<S> {
    /// Create a node, restoring durable state from `storage_path`.
    pub fn new<P: AsRef<Path>>(
        config: RaftConfig,
        storage_path: P,
        state_machine: S,
        rpc: Arc<dyn RaftRpc>,
    ) -> Result<(Self, mpsc::Receiver<RaftCommand<S::Result>>)> {
        let storage = Arc::new(RaftStorage::open(storage_path)?);

        let peers: Vec<NodeId> = config.peers.keys().copied().collect();
        let mut raft_state = RaftState::new(config.node_id, peers);
        if let Some(persistent) = storage.load_persistent_state()? {
            raft_state.persistent = persistent;
        }

        let mut log = RaftLog::new();
        let mut state_machine = state_machine;
        if let Some((snapshot_data, meta)) = storage.load_snapshot()? {
            state_machine.restore(&snapshot_data)?;
            log.compact(meta.last_index, meta.last_term);
            raft_state.commit_index = meta.last_index;
            raft_state.last_applied = meta.last_index;
        }
        for entry in storage.load_log_entries_from(log.first_index())? {
            log.append(entry)?;
        }

        let (command_tx, command_rx) = mpsc::channel(1024);
        let (leadership_tx, _) = watch::channel(LeadershipState::unknown());

        let node = Self {
            config,
            state: RwLock::new(raft_state),
            log: RwLock::new(log),
            storage,
            state_machine: RwLock::new(state_machine),
            rpc,
            command_tx,
            waiters: Mutex::new(HashMap::new()),
            leadership_tx,
            snapshots_in_flight: Mutex::new(HashSet::new()),
        };
        Ok((node, command_rx))
    }

    pub fn command_sender(&self) -> mpsc::Sender<RaftCommand<S::Result>> {
        self.command_tx.clone()
    }

    /// Subscribe to role/term transitions.
    pub fn leadership(&self) -> watch::Receiver<LeadershipState> {
        self.leadership_tx.subscribe()
    }

    /// Run the event loop until `Shutdown` or the channel closes.
    pub async fn run(self, command_rx: mpsc::Receiver<RaftCommand<S::Result>>) {
        Arc::new(self).run_loop(command_rx).await
    }

    async fn run_loop(self: Arc<Self>, mut command_rx: mpsc::Receiver<RaftCommand<S::Result>>) {
        let mut election_deadline = self.reset_election_deadline();
        let mut heartbeat = interval(self.config.heartbeat_interval);

        loop {
            let is_leader = self.state.read().is_leader();

            tokio::select! {
                maybe_cmd = command_rx.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    match cmd {
                        RaftCommand::Shutdown => {
                            info!(node_id = self.config.node_id, "raft node shutting down");
                            break;
                        }
                        RaftCommand::Propose { data, response } => {
                            self.handle_propose(data, response).await;
                        }
                        RaftCommand::RequestVote { request, response } => {
                            let _ = response.send(self.handle_request_vote(request));
                        }
                        RaftCommand::AppendEntries { request, response } => {
                            let result = self.handle_append_entries(request);
                            if result.success {
                                election_deadline = self.reset_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::InstallSnapshot { request, response } => {
                            let result = self.handle_install_snapshot(request);
                            election_deadline = self.reset_election_deadline();
                            let _ = response.send(result);
                        }
                        RaftCommand::Status { response } => {
                            let _ = response.send(self.leadership_now());
                        }
                    }
                }

                _ = heartbeat.tick(), if is_leader => {
                    self.replicate_to_all().await;
                }

                _ = tokio::time::sleep_until(election_deadline), if !is_leader => {
                    self.start_election().await;
                    election_deadline = self.reset_election_deadline();
                }
            }

            self.apply_committed_entries();
            self.maybe_snapshot();
            self.publish_leadership();
        }
    }

    fn leadership_now(&self) -> LeadershipState {
        let state = self.state.read();
        LeadershipState {
            term: state.current_term(),
            is_leader: state.is_leader(),
            leader_id: state.leader_id,
        }
    }

    fn publish_leadership(&self) {
        let now = self.leadership_now();
        if !now.is_leader {
            self.fail_waiters(now.leader_id);
        }
        gauge!("shoal_raft_term").set(now.term as f64);
        self.leadership_tx.send_if_modified(|current| {
            if *current == now {
                false
            } else {
                *current = now;
                true
            }
        });
    }

    /// Fail every parked proposer: this node can no longer commit them.
    fn fail_waiters(&self, leader: Option<NodeId>) {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return;
        }
        for (_, (_, tx)) in waiters.drain() {
            let _ = tx.send(Err(ShoalError::NotLeader { leader }));
        }
    }

    async fn handle_propose(
        self: &Arc<Self>,
        data: Vec<u8>,
        response: oneshot::Sender<Result<S::Result>>,
    ) {
        let (term, is_leader, leader) = {
            let state = self.state.read();
            (state.current_term(), state.is_leader(), state.leader_id)
        };
        if !is_leader {
            let _ = response.send(Err(ShoalError::NotLeader { leader }));
            return;
        }

        counter!("shoal_raft_proposals_total").increment(1);
        let index = {
            let mut log = self.log.write();
            let index = log.last_index() + 1;
            let entry = LogEntry::new(term, index, data);
            if let Err(e) = self.storage.append_log_entries(std::slice::from_ref(&entry)) {
                error!(error = %e, "failed to persist proposed entry");
                let _ = response.send(Err(e));
                return;
            }
            if let Err(e) = log.append(entry) {
                let _ = response.send(Err(e));
                return;
            }
            index
        };

        // Parked until the entry is applied (or leadership is lost).
        self.waiters.lock().insert(index, (term, response));
        self.replicate_to_all().await;
    }

    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.write();
        let log = self.log.read();

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
            self.persist_state(&state);
        }

        let vote_granted = if request.term < state.current_term() {
            false
        } else if state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            self.persist_state(&state);
            true
        };

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "handled vote request"
        );

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write();
        let mut log = self.log.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }

        if request.term < state.current_term() {
            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index: None,
            };
        }

        state.leader_id = Some(request.leader_id);

        if !log.matches(request.prev_log_index, request.prev_log_term) {
            // Walk back to the start of the conflicting term so the leader
            // can skip it in one step.
            let conflict_index = match log.term_at(request.prev_log_index) {
                Some(conflict_term) => {
                    let mut idx = request.prev_log_index;
                    while idx > log.first_index() && log.term_at(idx - 1) == Some(conflict_term)
                    {
                        idx -= 1;
                    }
                    Some(idx)
                }
                None => Some(log.last_index() + 1),
            };
            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index,
            };
        }

        let mut new_entries = Vec::new();
        for entry in request.entries {
            if entry.index <= log.last_index() {
                match log.get(entry.index) {
                    Some(existing) if existing.term == entry.term => {
                        // Already have it.
                    }
                    _ => {
                        log.truncate_from(entry.index);
                        if let Err(e) = self.storage.truncate_log_from(entry.index) {
                            error!(error = %e, index = entry.index, "log truncation failed");
                        }
                        new_entries.push(entry);
                    }
                }
            } else {
                new_entries.push(entry);
            }
        }

        if !new_entries.is_empty() {
            if let Err(e) = self.storage.append_log_entries(&new_entries) {
                error!(error = %e, "failed to persist replicated entries");
                return AppendEntriesResponse {
                    term: state.current_term(),
                    success: false,
                    match_index: log.last_index(),
                    conflict_index: None,
                };
            }
            for entry in new_entries {
                if let Err(e) = log.append(entry) {
                    error!(error = %e, "in-memory log append failed");
                }
            }
        }

        if request.leader_commit > state.commit_index {
            state.commit_index = request.leader_commit.min(log.last_index());
        }

        AppendEntriesResponse {
            term: state.current_term(),
            success: true,
            match_index: log.last_index(),
            conflict_index: None,
        }
    }

    fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }
        if request.term < state.current_term() {
            return InstallSnapshotResponse {
                term: state.current_term(),
                installed: false,
            };
        }
        state.leader_id = Some(request.leader_id);

        if let Err(e) = self.storage.save_snapshot(
            &request.data,
            request.last_included_index,
            request.last_included_term,
        ) {
            error!(error = %e, "failed to persist installed snapshot");
            return InstallSnapshotResponse {
                term: state.current_term(),
                installed: false,
            };
        }
        if let Err(e) = self.state_machine.write().restore(&request.data) {
            error!(error = %e, "failed to restore state machine from snapshot");
            return InstallSnapshotResponse {
                term: state.current_term(),
                installed: false,
            };
        }

        {
            let mut log = self.log.write();
            log.compact(request.last_included_index, request.last_included_term);
        }
        state.commit_index = request.last_included_index;
        state.last_applied = request.last_included_index;

        info!(
            node_id = self.config.node_id,
            index = request.last_included_index,
            "installed snapshot from leader"
        );

        InstallSnapshotResponse {
            term: state.current_term(),
            installed: true,
        }
    }

    async fn start_election(self: &Arc<Self>) {
        counter!("shoal_raft_elections_total").increment(1);
        let (term, last_log_index, last_log_term, quorum) = {
            let mut state = self.state.write();
            let log = self.log.read();
            state.become_candidate();
            self.persist_state(&state);
            (
                state.current_term(),
                log.last_index(),
                log.last_term(),
                state.quorum_size(),
            )
        };

        info!(node_id = self.config.node_id, term, "starting election");

        let mut votes = 1usize; // self-vote
        if votes >= quorum {
            // Single-node group.
            let last_index = self.log.read().last_index();
            self.state.write().become_leader(last_index);
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let peers: Vec<NodeId> = self.config.peers.keys().copied().collect();
        let vote_futures = peers.into_iter().map(|peer| {
            let rpc = Arc::clone(&self.rpc);
            let req = request.clone();
            async move {
                match timeout(Duration::from_millis(100), rpc.request_vote(peer, req)).await {
                    Ok(Ok(response)) => Some((peer, response)),
                    _ => None,
                }
            }
        });
        let results = futures::future::join_all(vote_futures).await;

        let mut won = false;
        {
            let mut state = self.state.write();
            for (peer, response) in results.into_iter().flatten() {
                if state.state != NodeState::Candidate || state.current_term() != term {
                    return;
                }
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_state(&state);
                    return;
                }
                if response.vote_granted {
                    votes += 1;
                    debug!(node_id = self.config.node_id, voter = peer, votes, "vote granted");
                }
            }
            if votes >= quorum {
                let last_index = self.log.read().last_index();
                state.become_leader(last_index);
                won = true;
            }
        }
        if won {
            self.replicate_to_all().await;
        }
    }

    async fn replicate_to_all(self: &Arc<Self>) {
        let (term, commit_index, leader_state) = {
            let state = self.state.read();
            if !state.is_leader() {
                return;
            }
            (state.current_term(), state.commit_index, state.leader.clone())
        };
        let Some(leader_state) = leader_state else { return };

        let mut futures = Vec::new();
        for (&peer, _) in &self.config.peers {
            let next_index = *leader_state.next_index.get(&peer).unwrap_or(&1);

            let (prev_log_index, prev_log_term, entries, needs_snapshot) = {
                let log = self.log.read();
                if next_index < log.first_index() {
                    (0, 0, Vec::new(), true)
                } else {
                    let prev_log_index = next_index.saturating_sub(1);
                    let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                    let entries =
                        log.entries_from(next_index, self.config.max_entries_per_append);
                    (prev_log_index, prev_log_term, entries, false)
                }
            };

            if needs_snapshot {
                self.spawn_snapshot_send(peer, term);
                continue;
            }

            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };
            let rpc = Arc::clone(&self.rpc);
            futures.push(async move {
                match timeout(Duration::from_millis(50), rpc.append_entries(peer, request)).await
                {
                    Ok(Ok(response)) => Some((peer, response)),
                    _ => None,
                }
            });
        }

        let results = futures::future::join_all(futures).await;

        let mut state = self.state.write();
        if !state.is_leader() {
            return;
        }
        for (peer, response) in results.into_iter().flatten() {
            if response.term > state.current_term() {
                state.become_follower(response.term, None);
                self.persist_state(&state);
                return;
            }
            if let Some(leader) = state.leader.as_mut() {
                if response.success {
                    leader.update_match(peer, response.match_index);
                } else if let Some(conflict_index) = response.conflict_index {
                    leader.next_index.insert(peer, conflict_index.max(1));
                } else {
                    leader.decrement_next(peer);
                }
            }
        }

        let last_log_index = self.log.read().last_index();
        let new_commit = state.calculate_commit_index(last_log_index);
        if new_commit > state.commit_index {
            state.commit_index = new_commit;
            debug!(node_id = state.node_id, commit_index = new_commit, "advanced commit index");
        }
    }

    /// Ship the durable snapshot to a follower whose next entry was
    /// compacted away. One transfer per follower at a time.
    fn spawn_snapshot_send(self: &Arc<Self>, peer: NodeId, term: Term) {
        if !self.snapshots_in_flight.lock().insert(peer) {
            return;
        }
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let result = node.send_snapshot(peer, term).await;
            node.snapshots_in_flight.lock().remove(&peer);
            if let Err(e) = result {
                warn!(error = %e, follower = peer, "snapshot transfer failed");
            }
        });
    }

    async fn send_snapshot(&self, peer: NodeId, term: Term) -> Result<()> {
        let (data, meta) = self
            .storage
            .load_snapshot()?
            .ok_or_else(|| ShoalError::Internal("no snapshot available to ship".into()))?;

        info!(
            node_id = self.config.node_id,
            follower = peer,
            size = data.len(),
            "shipping snapshot to lagging follower"
        );

        let request = InstallSnapshotRequest {
            term,
            leader_id: self.config.node_id,
            last_included_index: meta.last_index,
            last_included_term: meta.last_term,
            data,
        };
        let response = timeout(
            Duration::from_secs(10),
            self.rpc.install_snapshot(peer, request),
        )
        .await
        .map_err(|_| ShoalError::Network("snapshot transfer timed out".into()))??;

        let mut state = self.state.write();
        if response.term > state.current_term() {
            state.become_follower(response.term, None);
            self.persist_state(&state);
            return Err(ShoalError::NotLeader { leader: None });
        }
        if response.installed {
            if let Some(leader) = state.leader.as_mut() {
                leader.update_match(peer, meta.last_index);
            }
        }
        Ok(())
    }

    fn apply_committed_entries(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.commit_index, state.last_applied)
        };
        if commit_index <= last_applied {
            return;
        }

        let entries = {
            let log = self.log.read();
            log.entries_range(last_applied + 1, commit_index)
        };

        let mut state_machine = self.state_machine.write();
        for entry in entries {
            let result = state_machine.apply(entry.data_bytes());
            self.state.write().last_applied = entry.index;

            if let Some((term, tx)) = self.waiters.lock().remove(&entry.index) {
                if term == entry.term {
                    let _ = tx.send(Ok(result));
                } else {
                    // A different leader's entry landed at this index.
                    let leader = self.state.read().leader_id;
                    let _ = tx.send(Err(ShoalError::NotLeader { leader }));
                }
            }
        }
        gauge!("shoal_raft_commit_index").set(commit_index as f64);
    }

    fn maybe_snapshot(&self) {
        let (last_applied, covered) = {
            let state = self.state.read();
            let log = self.log.read();
            (state.last_applied, log.first_index().saturating_sub(1))
        };
        if last_applied.saturating_sub(covered) < self.config.snapshot_threshold as u64 {
            return;
        }

        let snapshot_data = self.state_machine.read().snapshot();
        let snapshot_term = self.log.read().term_at(last_applied).unwrap_or(0);

        if let Err(e) = self
            .storage
            .save_snapshot(&snapshot_data, last_applied, snapshot_term)
        {
            error!(error = %e, "failed to save snapshot");
            return;
        }
        self.log.write().compact(last_applied, snapshot_term);
        if let Err(e) = self.storage.compact_log(last_applied) {
            error!(error = %e, "failed to compact durable log");
        }

        info!(node_id = self.config.node_id, last_applied, "snapshot taken");
    }

    fn persist_state(&self, state: &RaftState) {
        if let Err(e) = self.storage.save_persistent_state(&state.persistent) {
            error!(error = %e, "failed to persist raft state");
        }
    }

    fn reset_election_deadline(&self) -> Instant {
        let timeout = rand::thread_rng()
            .gen_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Instant::now() + timeout
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct TestStateMachine {
        applied: Vec<Vec<u8>>,
    }

    impl StateMachine for TestStateMachine {
        type Result = usize;

        fn apply(&mut self, command: &[u8]) -> usize {
            self.applied.push(command.to_vec());
            self.applied.len()
        }

        fn snapshot(&self) -> Vec<u8> {
            bincode::serialize(&self.applied).unwrap_or_default()
        }

        fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
            self.applied = bincode::deserialize(snapshot)?;
            Ok(())
        }
    }

    fn single_node_config() -> RaftConfig {
        RaftConfig {
            node_id: 1,
            election_timeout_min: Duration::from_millis(10),
            election_timeout_max: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_starts_as_follower() {
        let dir = tempdir().unwrap();
        let (node, _rx) = RaftNode::new(
            single_node_config(),
            dir.path(),
            TestStateMachine::default(),
            Arc::new(NoopRpc),
        )
        .unwrap();
        assert!(!node.state.read().is_leader());
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_applies() {
        let dir = tempdir().unwrap();
        let (node, rx) = RaftNode::new(
            single_node_config(),
            dir.path(),
            TestStateMachine::default(),
            Arc::new(NoopRpc),
        )
        .unwrap();
        let tx = node.command_sender();
        let mut leadership = node.leadership();
        tokio::spawn(node.run(rx));

        // Wait for self-election.
        timeout(Duration::from_secs(1), async {
            loop {
                if leadership.borrow().is_leader {
                    return;
                }
                leadership.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: vec![42],
            response: resp_tx,
        })
        .await
        .unwrap();

        let applied = timeout(Duration::from_secs(1), resp_rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(applied, 1);

        let _ = tx.send(RaftCommand::Shutdown).await;
    }

    #[tokio::test]
    async fn test_propose_on_follower_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = single_node_config();
        // A peer keeps the node from winning instantly; NoopRpc denies
        // every vote.
        config.peers.insert(2, "127.0.0.1:1".into());
        config.peers.insert(3, "127.0.0.1:2".into());
        let (node, rx) = RaftNode::new(
            config,
            dir.path(),
            TestStateMachine::default(),
            Arc::new(NoopRpc),
        )
        .unwrap();
        let tx = node.command_sender();
        tokio::spawn(node.run(rx));

        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: vec![1],
            response: resp_tx,
        })
        .await
        .unwrap();
        let result = timeout(Duration::from_secs(1), resp_rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(ShoalError::NotLeader { .. })));

        let _ = tx.send(RaftCommand::Shutdown).await;
    }

    #[tokio::test]
    async fn test_wins_election_with_peer_votes() {
        use super::super::rpc::mock::MockRpc;

        let dir = tempdir().unwrap();
        let mut config = single_node_config();
        config.peers.insert(2, "peer-2".into());

        // Peer 2 grants every vote and acks every append.
        let rpc = MockRpc::new();
        rpc.register_handler(2, |msg| match msg {
            RaftMessage::RequestVote(req) => {
                RaftMessage::RequestVoteResponse(RequestVoteResponse {
                    term: req.term,
                    vote_granted: true,
                })
            }
            RaftMessage::AppendEntries(req) => {
                RaftMessage::AppendEntriesResponse(AppendEntriesResponse {
                    term: req.term,
                    success: true,
                    match_index: req.prev_log_index + req.entries.len() as u64,
                    conflict_index: None,
                })
            }
            other => other,
        })
        .await;

        let (node, rx) = RaftNode::new(
            config,
            dir.path(),
            TestStateMachine::default(),
            Arc::new(rpc),
        )
        .unwrap();
        let tx = node.command_sender();
        let mut leadership = node.leadership();
        tokio::spawn(node.run(rx));

        timeout(Duration::from_secs(2), async {
            loop {
                if leadership.borrow().is_leader {
                    return;
                }
                leadership.changed().await.unwrap();
            }
        })
        .await
        .expect("should win with the peer's vote");

        // Commit requires the peer's ack; the mock supplies it.
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: vec![7],
            response: resp_tx,
        })
        .await
        .unwrap();
        let applied = timeout(Duration::from_secs(2), resp_rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(applied, 1);

        let _ = tx.send(RaftCommand::Shutdown).await;
    }

    #[tokio::test]
    async fn test_restart_recovers_applied_state() {
        let dir = tempdir().unwrap();
        {
            let (node, rx) = RaftNode::new(
                single_node_config(),
                dir.path(),
                TestStateMachine::default(),
                Arc::new(NoopRpc),
            )
            .unwrap();
            let tx = node.command_sender();
            let mut leadership = node.leadership();
            let handle = tokio::spawn(node.run(rx));
            timeout(Duration::from_secs(1), async {
                loop {
                    if leadership.borrow().is_leader {
                        return;
                    }
                    leadership.changed().await.unwrap();
                }
            })
            .await
            .unwrap();

            for b in 0..3u8 {
                let (resp_tx, resp_rx) = oneshot::channel();
                tx.send(RaftCommand::Propose {
                    data: vec![b],
                    response: resp_tx,
                })
                .await
                .unwrap();
                timeout(Duration::from_secs(1), resp_rx)
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
            }
            let _ = tx.send(RaftCommand::Shutdown).await;
            // Wait for the node to drop its storage handle.
            handle.await.unwrap();
        }

        // Reopen: the log replays into a fresh state machine.
        let (node, _rx) = RaftNode::new(
            single_node_config(),
            dir.path(),
            TestStateMachine::default(),
            Arc::new(NoopRpc),
        )
        .unwrap();
        assert_eq!(node.log.read().last_index(), 3);
    }
}
