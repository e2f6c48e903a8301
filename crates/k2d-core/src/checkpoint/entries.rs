//! Checkpoint file types.
//!
//! Each file is one JSON document. `sources/0` holds the positions a fresh
//! query resolved its starting offsets to. `offsets/<batchId>` is written
//! before the batch is appended to the table, `commits/<batchId>` after.

use crate::source::PartitionOffsets;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the streaming query that owns the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    /// Query id, also the Delta `txn` application id
    pub id: String,
    /// Topic the query reads
    pub topic: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Positions a fresh query started from, written once before the first batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialOffsets {
    /// Topic name
    pub topic: String,
    /// Next offset per partition
    pub positions: PartitionOffsets,
    /// Timestamp
    pub created_at: DateTime<Utc>,
}

/// Write-ahead record of a planned batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetsEntry {
    /// Batch id (0, 1, 2, ...)
    pub batch_id: i64,
    /// Topic name
    pub topic: String,
    /// Next offset per partition before the batch
    pub start: PartitionOffsets,
    /// Next offset per partition after the batch
    pub end: PartitionOffsets,
    /// Records in the batch
    pub record_count: u64,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Marker that a batch is in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEntry {
    /// Batch id
    pub batch_id: i64,
    /// Table version holding the batch (None if unknown)
    pub table_version: Option<i64>,
    /// Records in the batch
    pub record_count: u64,
    /// Written during recovery rather than after the append
    #[serde(default)]
    pub recovered: bool,
    /// Timestamp
    pub committed_at: DateTime<Utc>,
}
