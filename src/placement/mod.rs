//! Replica placement planning.
//!
//! Given a batch of under-replicated chunks and the alive data nodes, the
//! planner assigns each chunk a receiver (a node that does not yet store
//! it) and a sender (a node that does), minimizing the variance of per-node
//! assignment counts so repair traffic spreads evenly. The search is a
//! depth-first assignment: candidates are tried least-loaded first, a
//! branch is cut as soon as even its best possible completion cannot beat
//! the best plan already found, and the whole search stops once a leaf
//! reaches the minimum achievable variance. The store matrix is mutated
//! transiently during the receiver search so that two queued occurrences
//! of the same chunk land on distinct receivers.

use crate::types::{ChunkId, DataNodeId};
use tracing::warn;

/// Output of one planning pass.
///
/// `chunk_ids`, `receivers` and `senders` run in parallel; `receivers` and
/// `senders` index into the `node_ids` slice the planner was given.
/// `skipped` holds batch entries the planner could not place this pass;
/// they stay in the under-replication queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementPlan {
    pub chunk_ids: Vec<ChunkId>,
    pub receivers: Vec<usize>,
    pub senders: Vec<usize>,
    pub skipped: Vec<ChunkId>,
}

impl PlacementPlan {
    pub fn empty() -> Self {
        Self {
            chunk_ids: Vec::new(),
            receivers: Vec::new(),
            senders: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }
}

/// The search-based allocator.
pub struct PlacementPlanner;

impl PlacementPlanner {
    /// Plan receivers and senders for a batch.
    ///
    /// `is_store[c][n]` means node `n` already holds or is assigned chunk
    /// `c`. Chunks that cannot be placed (no eligible receiver, or no
    /// holder to send from) are skipped with a degraded warning; the
    /// planner is not obliged to satisfy every chunk in one pass.
    pub fn plan(
        chunk_ids: &[ChunkId],
        node_ids: &[DataNodeId],
        is_store: &[Vec<bool>],
    ) -> PlacementPlan {
        if chunk_ids.is_empty() {
            return PlacementPlan::empty();
        }
        if node_ids.is_empty() {
            warn!(chunks = chunk_ids.len(), "no alive data nodes; placement degraded");
            return PlacementPlan {
                skipped: chunk_ids.to_vec(),
                ..PlacementPlan::empty()
            };
        }

        let (placeable, skipped) = partition_placeable(chunk_ids, node_ids.len(), is_store);
        if !skipped.is_empty() {
            warn!(
                placed = placeable.len(),
                skipped = skipped.len(),
                "placement degraded; unplaceable chunks stay queued"
            );
        }
        if placeable.is_empty() {
            return PlacementPlan {
                skipped,
                ..PlacementPlan::empty()
            };
        }

        let planned_ids: Vec<ChunkId> = placeable.iter().map(|&i| chunk_ids[i]).collect();
        let mut matrix: Vec<Vec<bool>> =
            placeable.iter().map(|&i| is_store[i].clone()).collect();

        let receivers = match search(&planned_ids, node_ids.len(), &mut matrix, true) {
            Some(plan) => plan,
            None => {
                // Feasibility was established above; treat as a full miss.
                warn!("receiver search found no assignment; batch stays queued");
                return PlacementPlan {
                    skipped: chunk_ids.to_vec(),
                    ..PlacementPlan::empty()
                };
            }
        };

        // A sender must hold the chunk: the same search over the inverted
        // matrix. Senders may repeat, so occurrences are not marked.
        let mut inverted: Vec<Vec<bool>> = placeable
            .iter()
            .map(|&i| is_store[i].iter().map(|b| !b).collect())
            .collect();
        let senders = match search(&planned_ids, node_ids.len(), &mut inverted, false) {
            Some(plan) => plan,
            None => {
                warn!("sender search found no assignment; batch stays queued");
                return PlacementPlan {
                    skipped: chunk_ids.to_vec(),
                    ..PlacementPlan::empty()
                };
            }
        };

        PlacementPlan {
            chunk_ids: planned_ids,
            receivers,
            senders,
            skipped,
        }
    }
}

/// Split batch positions into placeable and skipped.
///
/// A position is skipped when its chunk has no eligible receiver, no
/// holder, or more queued occurrences than free nodes.
fn partition_placeable(
    chunk_ids: &[ChunkId],
    node_count: usize,
    is_store: &[Vec<bool>],
) -> (Vec<usize>, Vec<ChunkId>) {
    let mut placeable = Vec::with_capacity(chunk_ids.len());
    let mut skipped = Vec::new();
    for (i, id) in chunk_ids.iter().enumerate() {
        let row = &is_store[i];
        let holders = row.iter().filter(|b| **b).count();
        let free = node_count - holders;
        if holders == 0 || free == 0 {
            skipped.push(*id);
            continue;
        }
        // Every earlier occurrence of this chunk consumes one free node.
        let prior = placeable
            .iter()
            .filter(|&&p| chunk_ids[p] == *id)
            .count();
        if prior >= free {
            skipped.push(*id);
            continue;
        }
        placeable.push(i);
    }
    (placeable, skipped)
}

/// Minimum achievable value of `sum((count - avg)^2)` over the batch.
///
/// Zero when the batch divides evenly. Otherwise `chunk_count - (avg-1) *
/// node_count` nodes carry the ceiling average (contributing nothing) and
/// every remaining node sits exactly one below it, contributing one each.
fn best_variance(chunk_count: usize, node_count: usize, avg: usize) -> i64 {
    if avg * node_count == chunk_count {
        0
    } else {
        let at_ceiling = chunk_count - (avg - 1) * node_count;
        (node_count - at_ceiling) as i64
    }
}

/// Depth-first search for a minimum-variance assignment.
///
/// `matrix[c][n]` marks node `n` ineligible for position `c`. When
/// `exclusive` is set, assigning a position also marks every other
/// position of the same chunk id at that node, and unmarks on backtrack.
/// Terminates early once a leaf reaches the best achievable variance.
fn search(
    chunk_ids: &[ChunkId],
    node_count: usize,
    matrix: &mut [Vec<bool>],
    exclusive: bool,
) -> Option<Vec<usize>> {
    let chunk_count = chunk_ids.len();
    let avg = chunk_count.div_ceil(node_count);
    let bound = best_variance(chunk_count, node_count, avg);

    let mut state = SearchState {
        chunk_ids,
        node_count,
        exclusive,
        avg: avg as i64,
        bound,
        counts: vec![0i64; node_count],
        assignment: vec![0usize; chunk_count],
        best: None,
        best_value: i64::MAX,
    };
    state.descend(matrix, 0);
    state.best
}

struct SearchState<'a> {
    chunk_ids: &'a [ChunkId],
    node_count: usize,
    exclusive: bool,
    avg: i64,
    bound: i64,
    counts: Vec<i64>,
    assignment: Vec<usize>,
    best: Option<Vec<usize>>,
    best_value: i64,
}

impl SearchState<'_> {
    /// Returns true when the bound was reached and the search may stop.
    fn descend(&mut self, matrix: &mut [Vec<bool>], position: usize) -> bool {
        if position == self.chunk_ids.len() {
            let value: i64 = self.counts.iter().map(|c| (c - self.avg).pow(2)).sum();
            if value < self.best_value {
                self.best_value = value;
                self.best = Some(self.assignment.clone());
            }
            return value == self.bound;
        }

        // Even the best completion of this prefix cannot beat the best
        // plan already found: cut the branch.
        if self.best.is_some() && self.completion_bound(position) >= self.best_value {
            return false;
        }

        // Least-loaded candidates first, so the first full assignment is
        // already near-balanced and the cutoff bites immediately.
        let mut candidates: Vec<usize> = (0..self.node_count)
            .filter(|&n| !matrix[position][n])
            .collect();
        candidates.sort_by_key(|&n| (self.counts[n], n));

        for node in candidates {
            self.assignment[position] = node;
            self.counts[node] += 1;
            let marked = if self.exclusive {
                self.mark_occurrences(matrix, position, node)
            } else {
                Vec::new()
            };

            let done = self.descend(matrix, position + 1);

            for row in &marked {
                matrix[*row][node] = false;
            }
            self.counts[node] -= 1;
            if done {
                return true;
            }
        }
        false
    }

    /// Lower bound on the final variance reachable from this prefix:
    /// hand the remaining assignments one by one to the lowest count,
    /// ignoring eligibility, and score the result. Relaxing the
    /// constraints only lowers the score, so the bound is admissible.
    fn completion_bound(&self, position: usize) -> i64 {
        let mut counts = self.counts.clone();
        for _ in position..self.chunk_ids.len() {
            if let Some(lowest) = counts.iter_mut().min() {
                *lowest += 1;
            }
        }
        counts.iter().map(|c| (c - self.avg).pow(2)).sum()
    }

    /// Mark every other position of the same chunk at `node`, returning
    /// the rows changed so backtracking can restore them.
    fn mark_occurrences(
        &self,
        matrix: &mut [Vec<bool>],
        position: usize,
        node: usize,
    ) -> Vec<usize> {
        let id = self.chunk_ids[position];
        let mut marked = Vec::new();
        for (row, chunk) in self.chunk_ids.iter().enumerate() {
            if row != position && *chunk == id && !matrix[row][node] {
                matrix[row][node] = true;
                marked.push(row);
            }
        }
        marked
    }
}
