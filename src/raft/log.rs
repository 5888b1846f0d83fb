//! The in-memory raft log.

use crate::error::{Result, ShoalError};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// A single log entry.
///
/// Command bytes are `Arc`-wrapped so replication clones are O(1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            data: Arc::new(data),
        }
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Serde helper: serialize the Arc'd command bytes as plain bytes.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Entries held in memory, with `first_index` advancing as snapshots
/// compact the prefix away.
#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`, for consistency checks.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(ShoalError::RaftLog(format!(
                "expected index {expected}, got {}",
                entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index + 1 == self.first_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries from `start_index`, capped at `limit`.
    pub fn entries_from(&self, start_index: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }
        let start = start_index.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries in the inclusive range `[start, end]`.
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.entries_from(start, usize::MAX)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Drop entries from `index` on (conflict resolution).
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// Does our log match the leader's at the given point?
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        self.term_at(prev_log_index) == Some(prev_log_term)
    }

    /// Drop the prefix up to and including `up_to_index` (snapshotting).
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }
        let to_remove = (up_to_index - self.first_index + 1) as usize;
        for _ in 0..to_remove.min(self.entries.len()) {
            self.entries.pop_front();
        }
        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Election rule: is a candidate's log at least as up-to-date as ours?
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        if last_log_term != self.last_term() {
            last_log_term > self.last_term()
        } else {
            last_log_index >= self.last_index()
        }
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
    }

    #[test]
    fn test_append_and_get() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![1])).unwrap();
        log.append(LogEntry::new(2, 2, vec![2])).unwrap();

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(1).unwrap().data_bytes(), &[1]);
        assert!(log.get(3).is_none());
        assert!(log.append(LogEntry::new(2, 9, vec![])).is_err());
    }

    #[test]
    fn test_truncate() {
        let mut log = RaftLog::new();
        for i in 1..=3 {
            log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
        }
        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_matches() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        log.append(LogEntry::new(2, 2, vec![])).unwrap();

        assert!(log.matches(0, 0));
        assert!(log.matches(2, 2));
        assert!(!log.matches(2, 1));
        assert!(!log.matches(3, 2));
    }

    #[test]
    fn test_compact_keeps_suffix() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(LogEntry::new(1, i, vec![i as u8])).unwrap();
        }
        log.compact(2, 1);

        assert_eq!(log.first_index(), 3);
        assert!(log.get(2).is_none());
        assert_eq!(log.get(3).unwrap().data_bytes(), &[3]);
        assert_eq!(log.term_at(2), Some(1));
    }

    #[test]
    fn test_is_up_to_date() {
        let mut log = RaftLog::new();
        log.append(LogEntry::new(1, 1, vec![])).unwrap();
        log.append(LogEntry::new(2, 2, vec![])).unwrap();

        assert!(log.is_up_to_date(1, 3));
        assert!(log.is_up_to_date(3, 2));
        assert!(log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(3, 1));
        assert!(!log.is_up_to_date(1, 2));
    }

    #[test]
    fn test_entries_from_limit() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(LogEntry::new(1, i, vec![])).unwrap();
        }
        assert_eq!(log.entries_from(2, 2).len(), 2);
        assert_eq!(log.entries_from(2, 2)[0].index, 2);
        assert!(log.entries_from(9, 10).is_empty());
        assert_eq!(log.entries_range(2, 4).len(), 3);
    }
}
