//! The master server: the façade clients and data nodes talk to, the raft
//! transport between master replicas, and the wiring that ties leadership
//! transitions to discovery registration and background controllers.

use super::ops::{MasterOp, OpResult};
use super::state::{MasterState, MasterStateMachine};
use super::tasks::{CommandSink, LivenessController, PeerObserver, RepairLoop};
use crate::config::MasterConfig;
use crate::discovery::DiscoveryStore;
use crate::error::{Result, ShoalError};
use crate::namespace::FileNode;
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, LeadershipState, NoopRpc, RaftCommand, RaftConfig, RaftNode,
    RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
use crate::types::{
    ChunkId, ChunkSendInfo, DataNodeId, FileNodeId, NodeId, ReadMode, SendType,
};
use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// Default connect timeout for raft RPC calls.
const RAFT_RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default request timeout for raft RPC calls.
const RAFT_RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for submitting commands to the replicated log.
///
/// `submit` resolves once the command is applied, or fails with
/// `ApplyTimeout` after the configured deadline. The command may still
/// commit after a timeout; callers retry with the same op id and the
/// apply-side dedupe makes the retry harmless.
#[derive(Clone)]
pub struct LogHandle {
    command_tx: mpsc::Sender<RaftCommand<OpResult>>,
    apply_timeout: Duration,
}

impl LogHandle {
    pub fn new(command_tx: mpsc::Sender<RaftCommand<OpResult>>, apply_timeout: Duration) -> Self {
        Self {
            command_tx,
            apply_timeout,
        }
    }

    pub async fn submit(&self, op: MasterOp) -> Result<OpResult> {
        let kind = op.kind();
        let data = bincode::serialize(&op)?;
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Propose { data, response: tx })
            .await
            .map_err(|_| ShoalError::Internal("raft node stopped".into()))?;

        match tokio::time::timeout(self.apply_timeout, rx).await {
            Err(_) => Err(ShoalError::ApplyTimeout(kind.to_string())),
            Ok(Err(_)) => Err(ShoalError::Internal("raft node dropped the command".into())),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn status(&self) -> Result<LeadershipState> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Status { response: tx })
            .await
            .map_err(|_| ShoalError::Internal("raft node stopped".into()))?;
        rx.await
            .map_err(|_| ShoalError::Internal("raft node stopped".into()))
    }
}

#[async_trait]
impl CommandSink for LogHandle {
    async fn submit(&self, op: MasterOp) -> Result<OpResult> {
        LogHandle::submit(self, op).await
    }
}

/// Response to a client `AddFile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddFileResponse {
    pub node: FileNode,
    /// For each chunk, the planned data nodes `(id, address)` the client
    /// should write to.
    pub planned_nodes: Vec<Vec<(DataNodeId, String)>>,
}

/// One transfer order returned to a heartbeating data node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOrder {
    pub chunk_id: ChunkId,
    pub receiver: DataNodeId,
    pub receiver_address: String,
    pub send_type: SendType,
}

/// The façade the RPC layer calls into.
///
/// Mutations travel through the log; reads are direct catalog lookups,
/// either on the leader (`Latest`) or on whatever replica this is
/// (`Stale`).
pub struct MasterServer {
    state: Arc<MasterState>,
    log: LogHandle,
    leadership: watch::Receiver<LeadershipState>,
}

impl MasterServer {
    pub fn new(
        state: Arc<MasterState>,
        log: LogHandle,
        leadership: watch::Receiver<LeadershipState>,
    ) -> Self {
        Self {
            state,
            log,
            leadership,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.borrow().is_leader
    }

    fn require_leader(&self) -> Result<()> {
        let lead = self.leadership.borrow().clone();
        if lead.is_leader {
            Ok(())
        } else {
            Err(ShoalError::NotLeader {
                leader: lead.leader_id,
            })
        }
    }

    fn unwrap_node(result: OpResult) -> Result<FileNode> {
        match result {
            OpResult::Node(node) => Ok(node),
            OpResult::Error { kind, message } => Err(OpResult::into_error(kind, message)),
            other => Err(ShoalError::Internal(format!(
                "unexpected apply result: {other:?}"
            ))),
        }
    }

    // ---- Client surface ----

    /// Create a file or directory. For files, the chunks are pre-assigned
    /// to the least-loaded alive data nodes.
    pub async fn add_file(
        &self,
        parent_path: &str,
        name: &str,
        size: u64,
        is_file: bool,
    ) -> Result<AddFileResponse> {
        self.require_leader()?;

        let replica_num = self.state.replication.replica_num;
        let targets = if is_file {
            let selected = self.state.nodes.allocate_top_k(replica_num);
            if selected.len() < replica_num {
                warn!(
                    selected = selected.len(),
                    replica_num,
                    "not enough alive data nodes; file starts under-replicated"
                );
            }
            selected
        } else {
            Vec::new()
        };

        let op = MasterOp::AddFileNode {
            op_id: Uuid::new_v4(),
            parent_path: parent_path.to_string(),
            name: name.to_string(),
            size,
            is_file,
            node_id: FileNodeId::new(),
            targets: targets.iter().map(|n| n.id).collect(),
        };
        let node = Self::unwrap_node(self.log.submit(op).await?)?;

        let per_chunk: Vec<(DataNodeId, String)> = targets
            .iter()
            .map(|n| (n.id, n.address.clone()))
            .collect();
        let planned_nodes = node.chunks.iter().map(|_| per_chunk.clone()).collect();

        Ok(AddFileResponse {
            node,
            planned_nodes,
        })
    }

    pub async fn move_node(&self, src_path: &str, dst_parent_path: &str) -> Result<FileNode> {
        self.require_leader()?;
        let op = MasterOp::MoveFileNode {
            op_id: Uuid::new_v4(),
            src_path: src_path.to_string(),
            dst_parent_path: dst_parent_path.to_string(),
        };
        Self::unwrap_node(self.log.submit(op).await?)
    }

    pub async fn remove(&self, path: &str) -> Result<FileNode> {
        self.require_leader()?;
        let op = MasterOp::RemoveFileNode {
            op_id: Uuid::new_v4(),
            path: path.to_string(),
            deleted_at: Utc::now(),
        };
        Self::unwrap_node(self.log.submit(op).await?)
    }

    pub async fn rename(&self, path: &str, new_name: &str) -> Result<FileNode> {
        self.require_leader()?;
        let op = MasterOp::RenameFileNode {
            op_id: Uuid::new_v4(),
            path: path.to_string(),
            new_name: new_name.to_string(),
        };
        Self::unwrap_node(self.log.submit(op).await?)
    }

    /// `Latest` reads are leader-only; `Stale` reads are served from this
    /// replica's state, which may lag the leader.
    pub fn stat(&self, path: &str, mode: ReadMode) -> Result<FileNode> {
        if mode == ReadMode::Latest {
            self.require_leader()?;
        }
        self.state.tree.lookup(path)
    }

    pub fn list(&self, path: &str, mode: ReadMode) -> Result<Vec<FileNode>> {
        if mode == ReadMode::Latest {
            self.require_leader()?;
        }
        self.state.tree.list(path)
    }

    pub fn chunk_replicas(
        &self,
        chunk_id: ChunkId,
        mode: ReadMode,
    ) -> Result<Vec<(DataNodeId, String)>> {
        if mode == ReadMode::Latest {
            self.require_leader()?;
        }
        self.state.chunk_replicas(chunk_id)
    }

    // ---- Data-node surface ----

    pub async fn register_data_node(&self, address: &str) -> Result<DataNodeId> {
        self.require_leader()?;
        let node_id = DataNodeId::new();
        let op = MasterOp::RegisterDataNode {
            op_id: Uuid::new_v4(),
            node_id,
            address: address.to_string(),
            registered_at: Utc::now(),
        };
        match self.log.submit(op).await? {
            OpResult::Registered { node_id } => {
                if self.state.nodes.needs_expansion(0) {
                    info!(node = %node_id, "new data node is well below the cluster average; repair traffic will fill it");
                }
                Ok(node_id)
            }
            OpResult::Error { kind, message } => Err(OpResult::into_error(kind, message)),
            other => Err(ShoalError::Internal(format!(
                "unexpected apply result: {other:?}"
            ))),
        }
    }

    /// Absorb a heartbeat and hand back the node's next transfer orders
    /// with resolved receiver addresses. Failures the node reports are
    /// absorbed into catalog state; they never fail the heartbeat itself.
    #[allow(clippy::too_many_arguments)]
    pub async fn heartbeat(
        &self,
        node_id: DataNodeId,
        address: &str,
        io_load: u32,
        chunk_ids: Vec<ChunkId>,
        successes: Vec<ChunkSendInfo>,
        failures: Vec<ChunkSendInfo>,
        invalid_chunk_ids: Vec<ChunkId>,
    ) -> Result<Vec<TransferOrder>> {
        self.require_leader()?;
        let op = MasterOp::Heartbeat {
            op_id: Uuid::new_v4(),
            node_id,
            address: address.to_string(),
            io_load,
            chunk_ids,
            successes,
            failures,
            invalid_chunk_ids,
            at: Utc::now(),
        };
        let orders = match self.log.submit(op).await? {
            OpResult::TransferOrders(orders) => orders,
            OpResult::Error { kind, message } => {
                return Err(OpResult::into_error(kind, message))
            }
            other => {
                return Err(ShoalError::Internal(format!(
                    "unexpected apply result: {other:?}"
                )))
            }
        };

        Ok(orders
            .into_iter()
            .filter_map(|info| {
                let receiver_address = self.state.nodes.address_of(info.receiver)?;
                Some(TransferOrder {
                    chunk_id: info.chunk_id,
                    receiver: info.receiver,
                    receiver_address,
                    send_type: info.send_type,
                })
            })
            .collect())
    }
}

/// HTTP raft transport between master replicas.
pub struct NetworkRpc {
    peers: HashMap<NodeId, String>,
    client: reqwest::Client,
}

impl NetworkRpc {
    pub fn new(peers: HashMap<NodeId, String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(RAFT_RPC_CONNECT_TIMEOUT)
            .timeout(RAFT_RPC_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { peers, client }
    }

    fn peer_url(&self, target: NodeId, endpoint: &str) -> Result<String> {
        self.peers
            .get(&target)
            .map(|addr| format!("http://{addr}/{endpoint}"))
            .ok_or(ShoalError::PeerNotFound(target))
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: String,
        request: &Req,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ShoalError::Network(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| ShoalError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl RaftRpc for NetworkRpc {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let url = self.peer_url(target, "raft/request_vote")?;
        self.post(url, &request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let url = self.peer_url(target, "raft/append_entries")?;
        self.post(url, &request).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let url = self.peer_url(target, "raft/install_snapshot")?;
        self.post(url, &request).await
    }
}

#[derive(Clone)]
struct RaftRouteState {
    command_tx: mpsc::Sender<RaftCommand<OpResult>>,
}

fn raft_router(command_tx: mpsc::Sender<RaftCommand<OpResult>>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .route("/health", axum::routing::get(|| async { "OK" }))
        .with_state(RaftRouteState { command_tx })
}

async fn handle_request_vote(
    State(route): State<RaftRouteState>,
    Json(request): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    let (tx, rx) = oneshot::channel();
    let fallback = RequestVoteResponse {
        term: request.term,
        vote_granted: false,
    };
    if route
        .command_tx
        .send(RaftCommand::RequestVote { request, response: tx })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

async fn handle_append_entries(
    State(route): State<RaftRouteState>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    let (tx, rx) = oneshot::channel();
    let fallback = AppendEntriesResponse {
        term: request.term,
        success: false,
        match_index: 0,
        conflict_index: None,
    };
    if route
        .command_tx
        .send(RaftCommand::AppendEntries { request, response: tx })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

async fn handle_install_snapshot(
    State(route): State<RaftRouteState>,
    Json(request): Json<InstallSnapshotRequest>,
) -> Json<InstallSnapshotResponse> {
    let (tx, rx) = oneshot::channel();
    let fallback = InstallSnapshotResponse {
        term: request.term,
        installed: false,
    };
    if route
        .command_tx
        .send(RaftCommand::InstallSnapshot { request, response: tx })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

/// Keep discovery registration and the leader-only controllers in sync
/// with this node's raft role. Each term gets fresh tasks bound to a
/// fresh shutdown channel; losing leadership fires it.
pub async fn run_leadership_tasks(
    state: Arc<MasterState>,
    log: LogHandle,
    discovery: Arc<dyn DiscoveryStore>,
    node_id: NodeId,
    advertise_addr: String,
    mut leadership: watch::Receiver<LeadershipState>,
) {
    let sink: Arc<dyn CommandSink> = Arc::new(log);
    let mut term_shutdown: Option<broadcast::Sender<()>> = None;

    loop {
        let lead = leadership.borrow_and_update().clone();

        if lead.is_leader && term_shutdown.is_none() {
            info!(node_id, term = lead.term, "leadership acquired; starting controllers");
            if let Err(e) = discovery.unregister_follower(node_id).await {
                warn!(error = %e, "failed to leave followers directory");
            }
            if let Err(e) = discovery.register_leader(node_id, &advertise_addr).await {
                warn!(error = %e, "failed to register leader key");
            }

            let (tx, _) = broadcast::channel(1);
            let replication = state.replication.clone();
            tokio::spawn(
                LivenessController::new(Arc::clone(&state), Arc::clone(&sink), replication.clone())
                    .run(tx.subscribe()),
            );
            tokio::spawn(
                RepairLoop::new(Arc::clone(&state), Arc::clone(&sink), replication)
                    .run(tx.subscribe()),
            );
            tokio::spawn(PeerObserver::new(Arc::clone(&discovery)).run(tx.subscribe()));
            term_shutdown = Some(tx);
        } else if !lead.is_leader && term_shutdown.is_some() {
            info!(node_id, term = lead.term, "leadership lost; cancelling controllers");
            if let Some(tx) = term_shutdown.take() {
                let _ = tx.send(());
            }
            if let Err(e) = discovery.unregister_leader(node_id).await {
                warn!(error = %e, "failed to release leader key");
            }
            if let Err(e) = discovery.register_follower(node_id, &advertise_addr).await {
                warn!(error = %e, "failed to join followers directory");
            }
        }

        if leadership.changed().await.is_err() {
            break;
        }
    }

    if let Some(tx) = term_shutdown.take() {
        let _ = tx.send(());
    }
}

/// Build and run a master replica: raft node, leadership tasks, and the
/// peer-facing raft transport.
pub async fn run_master_server(
    config: MasterConfig,
    discovery: Arc<dyn DiscoveryStore>,
) -> Result<()> {
    let state = Arc::new(MasterState::new(config.replication.clone()));
    let state_machine = MasterStateMachine::new(Arc::clone(&state));

    let raft_config = RaftConfig {
        node_id: config.node.id,
        peers: config.raft.peers.clone(),
        election_timeout_min: config.raft.election_timeout_min,
        election_timeout_max: config.raft.election_timeout_max,
        heartbeat_interval: config.raft.heartbeat_interval,
        snapshot_threshold: config.raft.snapshot_threshold,
        ..Default::default()
    };
    let rpc: Arc<dyn RaftRpc> = if config.raft.peers.is_empty() {
        Arc::new(NoopRpc)
    } else {
        Arc::new(NetworkRpc::new(config.raft.peers.clone()))
    };

    let raft_dir = config.storage.metadata_dir.join("raft");
    std::fs::create_dir_all(&raft_dir)?;
    let (node, command_rx) = RaftNode::new(raft_config, raft_dir, state_machine, rpc)?;
    let command_tx = node.command_sender();
    let leadership = node.leadership();
    tokio::spawn(node.run(command_rx));

    let log = LogHandle::new(command_tx.clone(), config.raft.apply_timeout);
    let advertise_addr = config.raft.bind_addr.to_string();
    tokio::spawn(run_leadership_tasks(
        state,
        log,
        discovery,
        config.node.id,
        advertise_addr,
        leadership,
    ));

    // The client/data-node RPC glue builds a `MasterServer` from this
    // state, log handle, and leadership watch; the raft routes below are
    // the part of the surface this process serves itself.
    let app = raft_router(command_tx);
    let listener = TcpListener::bind(config.raft.bind_addr).await?;
    info!(addr = %config.raft.bind_addr, node_id = config.node.id, "master raft transport listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| ShoalError::Network(e.to_string()))?;

    Ok(())
}
