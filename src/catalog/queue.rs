//! FIFO of chunk ids awaiting re-replication.
//!
//! Multiplicity is meaningful: a chunk id appears once per missing replica.

use crate::types::ChunkId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Thread-safe under-replication queue.
///
/// The repair loop wakes on a timer or as soon as the queue length reaches
/// the configured threshold; [`threshold_reached`](Self::threshold_reached)
/// is the async side of that early-wake condition.
pub struct UnderReplicationQueue {
    inner: Mutex<VecDeque<ChunkId>>,
    threshold: AtomicUsize,
    notify: Notify,
}

impl UnderReplicationQueue {
    pub fn new(threshold: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            threshold: AtomicUsize::new(threshold.max(1)),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Enqueue one missing replica of `id`.
    pub fn push(&self, id: ChunkId) {
        self.push_n(id, 1);
    }

    /// Enqueue `count` missing replicas of `id`.
    pub fn push_n(&self, id: ChunkId, count: usize) {
        if count == 0 {
            return;
        }
        let len = {
            let mut q = self.inner.lock();
            for _ in 0..count {
                q.push_back(id);
            }
            q.len()
        };
        if len >= self.threshold.load(Ordering::Relaxed) {
            self.notify.notify_waiters();
        }
    }

    /// Peek at the first `n` entries without removing them.
    pub fn batch_top(&self, n: usize) -> Vec<ChunkId> {
        let q = self.inner.lock();
        q.iter().take(n).copied().collect()
    }

    /// Remove the first `n` entries.
    pub fn batch_pop(&self, n: usize) -> Vec<ChunkId> {
        let mut q = self.inner.lock();
        let n = n.min(q.len());
        q.drain(..n).collect()
    }

    /// How many times `id` is currently queued.
    pub fn occurrences(&self, id: ChunkId) -> usize {
        self.inner.lock().iter().filter(|c| **c == id).count()
    }

    /// Resolves once the queue length reaches the wake threshold.
    pub async fn threshold_reached(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a push between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            if self.len() >= self.threshold.load(Ordering::Relaxed) {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot export in queue order.
    pub fn export(&self) -> Vec<ChunkId> {
        self.inner.lock().iter().copied().collect()
    }

    /// Replace the queue contents (snapshot restore).
    pub fn load(&self, ids: Vec<ChunkId>) {
        let mut q = self.inner.lock();
        q.clear();
        q.extend(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileNodeId;
    use std::sync::Arc;
    use std::time::Duration;

    fn chunk(i: u32) -> ChunkId {
        ChunkId::new(FileNodeId(uuid::Uuid::from_u128(1)), i)
    }

    #[test]
    fn test_fifo_order_and_multiplicity() {
        let q = UnderReplicationQueue::new(100);
        q.push_n(chunk(0), 2);
        q.push(chunk(1));

        assert_eq!(q.len(), 3);
        assert_eq!(q.occurrences(chunk(0)), 2);
        assert_eq!(q.batch_top(2), vec![chunk(0), chunk(0)]);
        assert_eq!(q.batch_pop(2), vec![chunk(0), chunk(0)]);
        assert_eq!(q.batch_pop(5), vec![chunk(1)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_top_does_not_consume() {
        let q = UnderReplicationQueue::new(100);
        q.push(chunk(0));
        assert_eq!(q.batch_top(10).len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_export_load_roundtrip() {
        let q = UnderReplicationQueue::new(100);
        q.push_n(chunk(0), 2);
        q.push(chunk(3));

        let exported = q.export();
        let restored = UnderReplicationQueue::new(100);
        restored.load(exported.clone());
        assert_eq!(restored.export(), exported);
    }

    #[tokio::test]
    async fn test_threshold_wakes_waiter() {
        let q = Arc::new(UnderReplicationQueue::new(3));
        let waiter = Arc::clone(&q);
        let handle = tokio::spawn(async move {
            waiter.threshold_reached().await;
        });

        q.push(chunk(0));
        q.push(chunk(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        q.push(chunk(2));
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake at threshold")
            .unwrap();
    }
}
