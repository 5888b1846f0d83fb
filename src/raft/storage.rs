//! Durable raft state on RocksDB.
//!
//! Two column families split the concerns: `log` holds entries keyed by
//! the big-endian entry index, so lexicographic key order is index order
//! and the whole family can be scanned without key filtering; `meta`
//! holds the term/vote pair and the latest snapshot. Log truncation and
//! compaction are single range deletes, not per-key scans.

use super::{LogEntry, PersistentState};
use crate::error::{Result, ShoalError};
use crate::types::LogIndex;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CF_META: &str = "meta";
const CF_LOG: &str = "log";

const TERM_VOTE_KEY: &[u8] = b"term_vote";
const SNAPSHOT_DATA_KEY: &[u8] = b"snapshot_data";
const SNAPSHOT_META_KEY: &[u8] = b"snapshot_meta";

/// Metadata of the durable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: u64,
}

/// Key-value storage for everything raft must not lose across restarts.
pub struct RaftStorage {
    db: DB,
}

impl RaftStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open_cf(&opts, path, [CF_META, CF_LOG])?;
        Ok(Self { db })
    }

    fn meta(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_META)
            .ok_or_else(|| ShoalError::Storage("meta column family missing".into()))
    }

    fn log(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_LOG)
            .ok_or_else(|| ShoalError::Storage("log column family missing".into()))
    }

    pub fn load_persistent_state(&self) -> Result<Option<PersistentState>> {
        match self.db.get_cf(self.meta()?, TERM_VOTE_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn save_persistent_state(&self, state: &PersistentState) -> Result<()> {
        self.db
            .put_cf(self.meta()?, TERM_VOTE_KEY, bincode::serialize(state)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn append_log_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let log = self.log()?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(log, entry.index.to_be_bytes(), bincode::serialize(entry)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_log_entries_from(&self, start_index: LogIndex) -> Result<Vec<LogEntry>> {
        let start = start_index.to_be_bytes();
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.log()?, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (_, value) = item?;
            entries.push(bincode::deserialize(&value)?);
        }
        Ok(entries)
    }

    /// Drop entries at and after `from_index` (conflict resolution).
    pub fn truncate_log_from(&self, from_index: LogIndex) -> Result<()> {
        self.delete_log_range(from_index, LogIndex::MAX)
    }

    /// Drop entries covered by a snapshot, up to and including
    /// `up_to_index`.
    pub fn compact_log(&self, up_to_index: LogIndex) -> Result<()> {
        self.delete_log_range(0, up_to_index.saturating_add(1))
    }

    /// Range delete over `[from, to)`. The range end is exclusive, but
    /// `LogIndex::MAX` is never a real entry index, so passing it covers
    /// the whole tail.
    fn delete_log_range(&self, from: LogIndex, to: LogIndex) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(self.log()?, from.to_be_bytes(), to.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Persist snapshot bytes and metadata atomically.
    pub fn save_snapshot(&self, data: &[u8], last_index: LogIndex, last_term: u64) -> Result<()> {
        let meta = self.meta()?;
        let snapshot_meta = SnapshotMeta {
            last_index,
            last_term,
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(meta, SNAPSHOT_DATA_KEY, data);
        batch.put_cf(meta, SNAPSHOT_META_KEY, bincode::serialize(&snapshot_meta)?);
        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<(Vec<u8>, SnapshotMeta)>> {
        let meta_cf = self.meta()?;
        let Some(meta) = self.db.get_cf(meta_cf, SNAPSHOT_META_KEY)? else {
            return Ok(None);
        };
        let Some(data) = self.db.get_cf(meta_cf, SNAPSHOT_DATA_KEY)? else {
            return Ok(None);
        };
        Ok(Some((data, bincode::deserialize(&meta)?)))
    }
}
