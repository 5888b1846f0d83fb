//! Text snapshot codec for the master state.
//!
//! A snapshot is four sections in fixed order -- path tree (pre-order),
//! chunk catalog, data-node catalog, under-replication queue -- each
//! terminated by a sentinel line. Records are `$`-separated fields;
//! set-valued fields render as `[a b c]`. All exports iterate in sorted
//! order so two replicas at the same commit index produce byte-identical
//! snapshots.

use super::state::MasterState;
use crate::error::{Result, ShoalError};
use crate::namespace::FileNode;
use crate::types::{Chunk, ChunkId, DataNode, DataNodeId, DataNodeStatus};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;

/// Sentinel line between sections. Must not appear in any field; file
/// names reject `$` at creation.
pub const SNAPSHOT_DELIMITER: &str = "$$$SNAPSHOT_DELIMITER$$$";

/// Serialize the full master state.
pub fn encode(state: &MasterState) -> Vec<u8> {
    let mut out = String::new();

    for node in state.tree.export_preorder() {
        let parent = node
            .parent
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-1".to_string());
        let deleted_at = node
            .deleted_at
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{}${}${}${}${}${}${}${}",
            node.id,
            node.name,
            parent,
            render_ids(node.chunks.iter()),
            node.size,
            node.is_file,
            node.is_deleted,
            deleted_at,
        );
    }
    out.push_str(SNAPSHOT_DELIMITER);
    out.push('\n');

    for chunk in state.chunks.export() {
        let _ = writeln!(
            out,
            "{}${}${}",
            chunk.id,
            render_ids(chunk.committed.iter()),
            render_ids(chunk.pending.iter()),
        );
    }
    out.push_str(SNAPSHOT_DELIMITER);
    out.push('\n');

    for node in state.nodes.export() {
        let _ = writeln!(
            out,
            "{}${}${}${}${}${}",
            node.id,
            node.status.code(),
            node.address,
            render_ids(node.chunks.iter()),
            node.io_load,
            node.last_heartbeat.timestamp_millis(),
        );
    }
    out.push_str(SNAPSHOT_DELIMITER);
    out.push('\n');

    for id in state.queue.export() {
        let _ = writeln!(out, "{id}");
    }
    out.push_str(SNAPSHOT_DELIMITER);
    out.push('\n');

    out.into_bytes()
}

/// Restore the full master state from snapshot bytes, replacing current
/// contents section by section.
pub fn decode(state: &MasterState, bytes: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ShoalError::SnapshotFormat(format!("snapshot is not UTF-8: {e}")))?;
    let mut lines = text.lines();

    let mut tree_records = Vec::new();
    for line in read_section(&mut lines)? {
        tree_records.push(parse_tree_record(line)?);
    }
    state.tree.restore_records(tree_records)?;

    let mut chunks = Vec::new();
    for line in read_section(&mut lines)? {
        chunks.push(parse_chunk_record(line)?);
    }
    state.chunks.load(chunks);

    let mut nodes = Vec::new();
    for line in read_section(&mut lines)? {
        nodes.push(parse_data_node_record(line)?);
    }
    state.nodes.load(nodes);

    let mut queue = Vec::new();
    for line in read_section(&mut lines)? {
        queue.push(ChunkId::from_str(line.trim())?);
    }
    state.queue.load(queue);

    Ok(())
}

/// Collect the lines of one section, erroring if the input ends before
/// the sentinel.
fn read_section<'a>(lines: &mut std::str::Lines<'a>) -> Result<Vec<&'a str>> {
    let mut section = Vec::new();
    for line in lines {
        if line == SNAPSHOT_DELIMITER {
            return Ok(section);
        }
        section.push(line);
    }
    Err(ShoalError::SnapshotFormat(
        "section not terminated by the delimiter".into(),
    ))
}

fn render_ids<T: std::fmt::Display>(ids: impl Iterator<Item = T>) -> String {
    let rendered: Vec<String> = ids.map(|id| id.to_string()).collect();
    format!("[{}]", rendered.join(" "))
}

fn parse_fields<'a>(line: &'a str, expected: usize, what: &str) -> Result<Vec<&'a str>> {
    let fields: Vec<&str> = line.split('$').collect();
    if fields.len() != expected {
        return Err(ShoalError::SnapshotFormat(format!(
            "{what} record has {} fields, expected {expected}: {line}",
            fields.len()
        )));
    }
    Ok(fields)
}

fn parse_id_set<T: FromStr>(field: &str, what: &str) -> Result<Vec<T>>
where
    T::Err: std::fmt::Display,
{
    let inner = field
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| {
            ShoalError::SnapshotFormat(format!("{what} set field is not bracketed: {field}"))
        })?;
    inner
        .split_whitespace()
        .map(|token| {
            token.parse::<T>().map_err(|e| {
                ShoalError::SnapshotFormat(format!("{what} set element {token}: {e}"))
            })
        })
        .collect()
}

fn parse_millis(field: &str, what: &str) -> Result<DateTime<Utc>> {
    let ms: i64 = field
        .parse()
        .map_err(|e| ShoalError::SnapshotFormat(format!("{what} timestamp {field}: {e}")))?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| ShoalError::SnapshotFormat(format!("{what} timestamp out of range")))
}

fn parse_tree_record(line: &str) -> Result<FileNode> {
    let fields = parse_fields(line, 8, "tree")?;
    let parent = if fields[2] == "-1" {
        None
    } else {
        Some(fields[2].parse().map_err(|e| {
            ShoalError::SnapshotFormat(format!("tree parent id {}: {e}", fields[2]))
        })?)
    };
    let deleted_at = if fields[7] == "-" {
        None
    } else {
        Some(parse_millis(fields[7], "tree deletion")?)
    };
    Ok(FileNode {
        id: fields[0]
            .parse()
            .map_err(|e| ShoalError::SnapshotFormat(format!("tree id {}: {e}", fields[0])))?,
        name: fields[1].to_string(),
        parent,
        children: HashMap::new(),
        chunks: parse_id_set(fields[3], "tree chunk")?,
        size: fields[4]
            .parse()
            .map_err(|e| ShoalError::SnapshotFormat(format!("tree size: {e}")))?,
        is_file: fields[5]
            .parse()
            .map_err(|e| ShoalError::SnapshotFormat(format!("tree is_file: {e}")))?,
        is_deleted: fields[6]
            .parse()
            .map_err(|e| ShoalError::SnapshotFormat(format!("tree is_deleted: {e}")))?,
        deleted_at,
    })
}

fn parse_chunk_record(line: &str) -> Result<Chunk> {
    let fields = parse_fields(line, 3, "chunk")?;
    Ok(Chunk {
        id: fields[0].parse()?,
        committed: parse_id_set::<DataNodeId>(fields[1], "chunk committed")?
            .into_iter()
            .collect(),
        pending: parse_id_set::<DataNodeId>(fields[2], "chunk pending")?
            .into_iter()
            .collect(),
    })
}

fn parse_data_node_record(line: &str) -> Result<DataNode> {
    let fields = parse_fields(line, 6, "data node")?;
    let status_code: u8 = fields[1]
        .parse()
        .map_err(|e| ShoalError::SnapshotFormat(format!("data node status: {e}")))?;
    let status = DataNodeStatus::from_code(status_code).ok_or_else(|| {
        ShoalError::SnapshotFormat(format!("unknown data node status {status_code}"))
    })?;
    Ok(DataNode {
        id: fields[0]
            .parse()
            .map_err(|e| ShoalError::SnapshotFormat(format!("data node id: {e}")))?,
        status,
        address: fields[2].to_string(),
        chunks: parse_id_set::<ChunkId>(fields[3], "data node chunk")?
            .into_iter()
            .collect(),
        io_load: fields[4]
            .parse()
            .map_err(|e| ShoalError::SnapshotFormat(format!("data node io load: {e}")))?,
        transfer_plan: Default::default(),
        last_heartbeat: parse_millis(fields[5], "data node heartbeat")?,
    })
}
