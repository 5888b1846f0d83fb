//! The chunk catalog: committed and pending replica sets per chunk.

use super::UnderReplicationQueue;
use crate::types::{Chunk, ChunkId, ChunkSendInfo, DataNodeId, SendType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Catalog of every chunk in the file system.
///
/// All multi-chunk mutations take the single catalog write lock so a batch
/// appears atomic to readers. Any mutation that abandons a pending
/// assignment pushes the chunk back onto the under-replication queue before
/// the lock is released, so the repair loop eventually retries.
pub struct ChunkCatalog {
    chunks: RwLock<HashMap<ChunkId, Chunk>>,
    queue: Arc<UnderReplicationQueue>,
    replica_num: usize,
}

impl ChunkCatalog {
    pub fn new(replica_num: usize, queue: Arc<UnderReplicationQueue>) -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            queue,
            replica_num,
        }
    }

    pub fn replica_num(&self) -> usize {
        self.replica_num
    }

    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }

    pub fn get(&self, id: ChunkId) -> Option<Chunk> {
        self.chunks.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.read().contains_key(&id)
    }

    /// Create the chunks of a new file, pre-assigned to `targets`.
    ///
    /// Each chunk short of the replication factor is queued once per
    /// missing replica. Re-creating an existing chunk id is a no-op so
    /// retried commands converge.
    pub fn create_for_file(&self, chunk_ids: &[ChunkId], targets: &[DataNodeId]) {
        let mut chunks = self.chunks.write();
        for id in chunk_ids {
            if chunks.contains_key(id) {
                continue;
            }
            let mut chunk = Chunk::new(*id);
            chunk.pending.extend(targets.iter().copied());
            let deficit = self.replica_num.saturating_sub(chunk.replica_count());
            chunks.insert(*id, chunk);
            self.queue.push_n(*id, deficit);
        }
    }

    /// Keep only ids of chunks that still exist and are under-replicated.
    pub fn batch_filter(&self, ids: &[ChunkId]) -> Vec<ChunkId> {
        let chunks = self.chunks.read();
        ids.iter()
            .copied()
            .filter(|id| {
                chunks
                    .get(id)
                    .is_some_and(|c| c.is_under_replicated(self.replica_num))
            })
            .collect()
    }

    /// Drop all pending assignments of the given chunks, re-queueing one
    /// missing replica per dropped assignment.
    pub fn batch_clear_pending(&self, ids: &[ChunkId]) {
        let mut chunks = self.chunks.write();
        for id in ids {
            if let Some(chunk) = chunks.get_mut(id) {
                let dropped = chunk.pending.len();
                chunk.pending.clear();
                self.queue.push_n(*id, dropped);
            }
        }
    }

    /// Record a placement plan: each receiver becomes a pending replica.
    pub fn batch_apply_plan(&self, assignments: &[(ChunkId, DataNodeId)]) {
        let mut chunks = self.chunks.write();
        for (chunk_id, receiver) in assignments {
            match chunks.get_mut(chunk_id) {
                Some(chunk) => {
                    if !chunk.committed.contains(receiver) {
                        chunk.pending.insert(*receiver);
                    }
                }
                None => warn!(chunk = %chunk_id, "plan references a vanished chunk"),
            }
        }
    }

    /// Absorb transfer confirmations reported by `reporter`'s heartbeat.
    ///
    /// Successes promote the receiver from pending to committed; a `Move`
    /// success additionally retires the reporter's own replica. Failures
    /// abandon the assignment and re-queue the chunk.
    pub fn confirm_transfers(
        &self,
        reporter: DataNodeId,
        successes: &[ChunkSendInfo],
        failures: &[ChunkSendInfo],
    ) {
        let mut chunks = self.chunks.write();
        for info in successes {
            let Some(chunk) = chunks.get_mut(&info.chunk_id) else {
                continue;
            };
            chunk.pending.remove(&info.receiver);
            chunk.committed.insert(info.receiver);
            if info.send_type == SendType::Move {
                chunk.committed.remove(&reporter);
            }
        }
        for info in failures {
            let Some(chunk) = chunks.get_mut(&info.chunk_id) else {
                continue;
            };
            if chunk.pending.remove(&info.receiver)
                && chunk.is_under_replicated(self.replica_num)
            {
                self.queue.push(info.chunk_id);
            }
        }
    }

    /// Absorb the chunk ids a node claims to hold: pending assignments are
    /// promoted to committed, unknown-but-existing chunks gain a replica.
    pub fn confirm_claims(&self, node: DataNodeId, claimed: &[ChunkId]) {
        let mut chunks = self.chunks.write();
        for id in claimed {
            if let Some(chunk) = chunks.get_mut(id) {
                chunk.pending.remove(&node);
                chunk.committed.insert(node);
            }
        }
    }

    /// Remove `node` from the replica sets of the given chunks, queueing
    /// each chunk that the removal left under-replicated.
    pub fn remove_replica_on(&self, node: DataNodeId, ids: &[ChunkId]) {
        let mut chunks = self.chunks.write();
        for id in ids {
            if let Some(chunk) = chunks.get_mut(id) {
                let removed =
                    chunk.committed.remove(&node) || chunk.pending.remove(&node);
                if removed && chunk.is_under_replicated(self.replica_num) {
                    self.queue.push(*id);
                }
            }
        }
    }

    /// Abandon planned transfers whose sender is gone: the receivers'
    /// pending assignments are dropped and the chunks re-queued.
    pub fn abandon_transfers(&self, transfers: &[ChunkSendInfo]) {
        let mut chunks = self.chunks.write();
        for info in transfers {
            if let Some(chunk) = chunks.get_mut(&info.chunk_id) {
                if chunk.pending.remove(&info.receiver)
                    && chunk.is_under_replicated(self.replica_num)
                {
                    self.queue.push(info.chunk_id);
                }
            }
        }
    }

    /// Build the planner's store matrix: `matrix[c][n]` is true when node
    /// `n` already holds or is assigned chunk `c`.
    pub fn store_state(&self, chunk_ids: &[ChunkId], node_ids: &[DataNodeId]) -> Vec<Vec<bool>> {
        let chunks = self.chunks.read();
        chunk_ids
            .iter()
            .map(|chunk_id| {
                let chunk = chunks.get(chunk_id);
                node_ids
                    .iter()
                    .map(|node| chunk.is_some_and(|c| c.stores(node)))
                    .collect()
            })
            .collect()
    }

    /// Snapshot export, sorted by chunk id for byte-stable output.
    pub fn export(&self) -> Vec<Chunk> {
        let chunks = self.chunks.read();
        let mut all: Vec<Chunk> = chunks.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    /// Replace catalog contents (snapshot restore).
    pub fn load(&self, all: Vec<Chunk>) {
        let mut chunks = self.chunks.write();
        chunks.clear();
        for chunk in all {
            chunks.insert(chunk.id, chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileNodeId;

    fn setup() -> (ChunkCatalog, Arc<UnderReplicationQueue>) {
        let queue = Arc::new(UnderReplicationQueue::new(1000));
        (ChunkCatalog::new(3, Arc::clone(&queue)), queue)
    }

    fn ids(file: FileNodeId, n: u32) -> Vec<ChunkId> {
        (0..n).map(|i| ChunkId::new(file, i)).collect()
    }

    #[test]
    fn test_create_full_assignment_queues_nothing() {
        let (catalog, queue) = setup();
        let file = FileNodeId::new();
        let targets: Vec<DataNodeId> = (0..3).map(|_| DataNodeId::new()).collect();
        catalog.create_for_file(&ids(file, 2), &targets);

        assert_eq!(catalog.len(), 2);
        assert!(queue.is_empty());
        let chunk = catalog.get(ChunkId::new(file, 0)).unwrap();
        assert_eq!(chunk.pending.len(), 3);
        assert!(chunk.committed.is_empty());
    }

    #[test]
    fn test_create_short_assignment_queues_deficit() {
        let (catalog, queue) = setup();
        let file = FileNodeId::new();
        let targets = vec![DataNodeId::new()];
        catalog.create_for_file(&ids(file, 2), &targets);

        // Two chunks, each missing two replicas.
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.occurrences(ChunkId::new(file, 0)), 2);
    }

    #[test]
    fn test_batch_filter_drops_satisfied_and_missing() {
        let (catalog, _queue) = setup();
        let file = FileNodeId::new();
        let full = ChunkId::new(file, 0);
        let short = ChunkId::new(file, 1);
        let gone = ChunkId::new(file, 2);
        let targets: Vec<DataNodeId> = (0..3).map(|_| DataNodeId::new()).collect();
        catalog.create_for_file(&[full], &targets);
        catalog.create_for_file(&[short], &targets[..1]);

        assert_eq!(catalog.batch_filter(&[full, short, gone]), vec![short]);
    }

    #[test]
    fn test_clear_pending_requeues() {
        let (catalog, queue) = setup();
        let file = FileNodeId::new();
        let chunk = ChunkId::new(file, 0);
        let targets: Vec<DataNodeId> = (0..3).map(|_| DataNodeId::new()).collect();
        catalog.create_for_file(&[chunk], &targets);
        assert!(queue.is_empty());

        catalog.batch_clear_pending(&[chunk]);
        assert_eq!(queue.occurrences(chunk), 3);
        assert_eq!(catalog.get(chunk).unwrap().pending.len(), 0);
    }

    #[test]
    fn test_confirm_transfers_copy_and_move() {
        let (catalog, queue) = setup();
        let file = FileNodeId::new();
        let chunk = ChunkId::new(file, 0);
        let sender = DataNodeId::new();
        let receiver = DataNodeId::new();
        catalog.create_for_file(&[chunk], &[]);
        catalog.confirm_claims(sender, &[chunk]);
        catalog.batch_apply_plan(&[(chunk, receiver)]);

        catalog.confirm_transfers(
            sender,
            &[ChunkSendInfo {
                chunk_id: chunk,
                receiver,
                send_type: SendType::Copy,
            }],
            &[],
        );
        let state = catalog.get(chunk).unwrap();
        assert!(state.committed.contains(&receiver));
        assert!(state.committed.contains(&sender));
        assert!(state.pending.is_empty());

        // A Move success retires the sender's replica.
        let mover = DataNodeId::new();
        catalog.batch_apply_plan(&[(chunk, mover)]);
        catalog.confirm_transfers(
            sender,
            &[ChunkSendInfo {
                chunk_id: chunk,
                receiver: mover,
                send_type: SendType::Move,
            }],
            &[],
        );
        let state = catalog.get(chunk).unwrap();
        assert!(state.committed.contains(&mover));
        assert!(!state.committed.contains(&sender));
        let _ = queue;
    }

    #[test]
    fn test_failed_transfer_requeues() {
        let (catalog, queue) = setup();
        let file = FileNodeId::new();
        let chunk = ChunkId::new(file, 0);
        let sender = DataNodeId::new();
        let receiver = DataNodeId::new();
        catalog.create_for_file(&[chunk], &[]);
        catalog.confirm_claims(sender, &[chunk]);
        let queued_before = queue.occurrences(chunk);
        catalog.batch_apply_plan(&[(chunk, receiver)]);

        catalog.confirm_transfers(
            sender,
            &[],
            &[ChunkSendInfo {
                chunk_id: chunk,
                receiver,
                send_type: SendType::Copy,
            }],
        );
        assert!(catalog.get(chunk).unwrap().pending.is_empty());
        assert_eq!(queue.occurrences(chunk), queued_before + 1);
    }

    #[test]
    fn test_remove_replica_queues_when_under() {
        let (catalog, queue) = setup();
        let file = FileNodeId::new();
        let chunk = ChunkId::new(file, 0);
        let nodes: Vec<DataNodeId> = (0..3).map(|_| DataNodeId::new()).collect();
        catalog.create_for_file(&[chunk], &nodes);
        catalog.confirm_claims(nodes[0], &[chunk]);
        catalog.confirm_claims(nodes[1], &[chunk]);
        catalog.confirm_claims(nodes[2], &[chunk]);
        assert!(queue.is_empty());

        catalog.remove_replica_on(nodes[2], &[chunk]);
        assert_eq!(queue.occurrences(chunk), 1);
        assert_eq!(catalog.get(chunk).unwrap().committed.len(), 2);
    }

    #[test]
    fn test_store_state_matrix() {
        let (catalog, _queue) = setup();
        let file = FileNodeId::new();
        let chunks = ids(file, 2);
        let holder = DataNodeId::new();
        let other = DataNodeId::new();
        catalog.create_for_file(&chunks, &[]);
        catalog.confirm_claims(holder, &chunks[..1]);

        let matrix = catalog.store_state(&chunks, &[holder, other]);
        assert_eq!(matrix, vec![vec![true, false], vec![false, false]]);
    }

    #[test]
    fn test_export_is_sorted_and_loads_back() {
        let (catalog, _queue) = setup();
        let file = FileNodeId::new();
        let chunks = ids(file, 5);
        catalog.create_for_file(&chunks, &[DataNodeId::new()]);

        let exported = catalog.export();
        let sorted: Vec<ChunkId> = exported.iter().map(|c| c.id).collect();
        let mut expected = sorted.clone();
        expected.sort();
        assert_eq!(sorted, expected);

        let (restored, _q) = setup();
        restored.load(exported.clone());
        assert_eq!(restored.export(), exported);
    }
}
