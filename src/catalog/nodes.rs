//! The data-node catalog: chunkserver records, heartbeat absorption, the
//! degrade ladder, and top-K least-loaded selection.

use crate::observability;
use crate::types::{
    ChunkId, ChunkSendInfo, DataNode, DataNodeId, DataNodeStatus, DegradeStage, TransferStage,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BinaryHeap, BTreeSet, HashMap};
use tracing::{info, warn};

/// Heap key for top-K selection: fewest chunks wins, lower I/O load breaks
/// ties. The `BinaryHeap` is a max-heap, so the worst candidate sits on top
/// and is evicted first.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    chunk_count: usize,
    io_load: u32,
    id: DataNodeId,
}

/// Catalog of every registered data node.
///
/// A `Dead` node is never present: the Dead degrade removes the record and
/// its id is not reused.
pub struct DataNodeCatalog {
    nodes: RwLock<HashMap<DataNodeId, DataNode>>,
}

impl DataNodeCatalog {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn get(&self, id: DataNodeId) -> Option<DataNode> {
        self.nodes.read().get(&id).cloned()
    }

    pub fn contains(&self, id: DataNodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    pub fn alive_count(&self) -> usize {
        self.nodes.read().values().filter(|n| n.is_alive()).count()
    }

    /// Register a data node, or refresh an existing registration.
    pub fn register(&self, id: DataNodeId, address: &str, at: DateTime<Utc>) -> DataNode {
        let node = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .entry(id)
                .or_insert_with(|| DataNode::new(id, address.to_string(), at));
            node.address = address.to_string();
            node.status = DataNodeStatus::Alive;
            node.last_heartbeat = at;
            node.clone()
        };
        info!(node = %id, address, "data node registered");
        observability::set_alive_datanodes(self.alive_count());
        node
    }

    /// Absorb one heartbeat: refresh liveness and load, drop confirmed
    /// transfer-plan entries, record claimed chunks, and hand out the next
    /// transfer orders (`WaitToInform` entries flip to `WaitToSend`).
    ///
    /// Returns `None` for an unknown node; the caller treats that as a
    /// fresh registration.
    pub fn absorb_heartbeat(
        &self,
        id: DataNodeId,
        io_load: u32,
        claimed: &[ChunkId],
        successes: &[ChunkSendInfo],
        failures: &[ChunkSendInfo],
        at: DateTime<Utc>,
    ) -> Option<Vec<ChunkSendInfo>> {
        let orders = {
            let mut nodes = self.nodes.write();
            let node = nodes.get_mut(&id)?;
            let was_alive = node.is_alive();
            node.last_heartbeat = at;
            node.status = DataNodeStatus::Alive;
            node.io_load = io_load;

            for info in successes.iter().chain(failures) {
                node.transfer_plan.remove(info);
            }
            node.chunks.extend(claimed.iter().copied());

            let mut orders = Vec::new();
            for (info, stage) in node.transfer_plan.iter_mut() {
                if *stage == TransferStage::WaitToInform {
                    *stage = TransferStage::WaitToSend;
                    orders.push(*info);
                }
            }
            if !was_alive {
                info!(node = %id, "data node recovered from waiting");
            }
            orders
        };
        observability::set_alive_datanodes(self.alive_count());
        Some(orders)
    }

    /// Forget chunks a node reported as invalid.
    pub fn remove_chunks(&self, id: DataNodeId, ids: &[ChunkId]) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(&id) {
            for chunk in ids {
                node.chunks.remove(chunk);
            }
        }
    }

    /// Record that the receivers of confirmed transfers now hold the chunk.
    pub fn batch_add_chunks(&self, successes: &[ChunkSendInfo]) {
        let mut nodes = self.nodes.write();
        for info in successes {
            if let Some(node) = nodes.get_mut(&info.receiver) {
                node.chunks.insert(info.chunk_id);
            }
        }
    }

    /// Record a sender plan: each sender learns which chunk to ship where.
    pub fn apply_sender_plan(&self, assignments: &[(DataNodeId, ChunkSendInfo)]) {
        let mut nodes = self.nodes.write();
        for (sender, info) in assignments {
            match nodes.get_mut(sender) {
                Some(node) => {
                    node.transfer_plan.insert(*info, TransferStage::WaitToInform);
                }
                None => warn!(node = %sender, "sender plan references a vanished node"),
            }
        }
    }

    /// Demote a node. `Waiting` only flips the status; `Dead` removes the
    /// record and returns it so the caller can re-queue its chunks and
    /// abandon its outbound transfers.
    pub fn degrade(&self, id: DataNodeId, stage: DegradeStage) -> Option<DataNode> {
        let removed = {
            let mut nodes = self.nodes.write();
            match stage {
                DegradeStage::Waiting => {
                    if let Some(node) = nodes.get_mut(&id) {
                        node.status = DataNodeStatus::Waiting;
                    }
                    None
                }
                DegradeStage::Dead => nodes.remove(&id),
            }
        };
        info!(node = %id, ?stage, "data node degraded");
        observability::set_alive_datanodes(self.alive_count());
        removed
    }

    /// Ids of alive nodes, sorted for deterministic plans.
    pub fn alive_ids(&self) -> Vec<DataNodeId> {
        let mut ids: Vec<DataNodeId> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.is_alive())
            .map(|n| n.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn address_of(&self, id: DataNodeId) -> Option<String> {
        self.nodes.read().get(&id).map(|n| n.address.clone())
    }

    /// Resolve the given replica holders to `(id, address)`, least I/O
    /// load first, so clients try the least busy replica.
    pub fn sorted_by_load(&self, ids: &BTreeSet<DataNodeId>) -> Vec<(DataNodeId, String)> {
        let nodes = self.nodes.read();
        let mut held: Vec<&DataNode> = ids.iter().filter_map(|id| nodes.get(id)).collect();
        held.sort_by_key(|n| (n.io_load, n.id));
        held.iter().map(|n| (n.id, n.address.clone())).collect()
    }

    /// Select the `k` alive nodes storing the fewest chunks, rebuilding
    /// the bounded max-heap from scratch. Ties fall to lower I/O load.
    pub fn allocate_top_k(&self, k: usize) -> Vec<DataNode> {
        let nodes = self.nodes.read();
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
        for node in nodes.values().filter(|n| n.is_alive()) {
            let entry = HeapEntry {
                chunk_count: node.chunk_count(),
                io_load: node.io_load,
                id: node.id,
            };
            if heap.len() < k {
                heap.push(entry);
            } else if let Some(top) = heap.peek() {
                if entry < *top {
                    heap.pop();
                    heap.push(entry);
                }
            }
        }
        let mut selected = heap.into_vec();
        selected.sort();
        selected
            .iter()
            .filter_map(|e| nodes.get(&e.id).cloned())
            .collect()
    }

    /// Mean chunk count across all registered nodes.
    pub fn avg_chunk_count(&self) -> usize {
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return 0;
        }
        let total: usize = nodes.values().map(|n| n.chunk_count()).sum();
        total / nodes.len()
    }

    /// Whether a node holding `chunk_count` chunks should receive
    /// rebalance traffic. A node within one chunk of the cluster average
    /// does not.
    pub fn needs_expansion(&self, chunk_count: usize) -> bool {
        let avg = self.avg_chunk_count();
        avg.saturating_sub(chunk_count) > 1
    }

    /// Snapshot export, sorted by node id for byte-stable output. Also the
    /// read path of the liveness scan.
    pub fn export(&self) -> Vec<DataNode> {
        let mut all: Vec<DataNode> = self.nodes.read().values().cloned().collect();
        all.sort_by_key(|n| n.id);
        all
    }

    /// Replace catalog contents (snapshot restore).
    pub fn load(&self, all: Vec<DataNode>) {
        let mut nodes = self.nodes.write();
        nodes.clear();
        for node in all {
            nodes.insert(node.id, node);
        }
        drop(nodes);
        observability::set_alive_datanodes(self.alive_count());
    }
}

impl Default for DataNodeCatalog {
    fn default() -> Self {
        Self::new()
    }
}
