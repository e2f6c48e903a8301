//! Resuming a query from its checkpoint.
//!
//! The checkpoint and the table are written in sequence: offsets, table
//! append, commit marker. A crash can leave the last offsets entry without a
//! marker; the table's `txn` for the query decides whether that batch landed.
//! Before any batch, the initial offsets entry pins where a fresh query starts.

use super::entries::{CheckpointMetadata, CommitEntry, OffsetsEntry};
use super::store::CheckpointStore;
use crate::source::PartitionOffsets;
use crate::Result;
use tracing::{info, warn};

/// How the next batch is planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// No batch was ever planned; start from the configured starting offsets
    Fresh,
    /// The latest batch is committed; continue after it
    Resume {
        /// Id of the next batch
        next_batch_id: i64,
        /// Read positions
        positions: PartitionOffsets,
    },
    /// The latest batch reached the table but its marker is missing
    CompleteCommit {
        /// Batch whose marker must be written
        batch_id: i64,
        /// Records in that batch
        record_count: u64,
        /// Read positions after it
        positions: PartitionOffsets,
    },
    /// The latest batch never reached the table; plan it again
    Replan {
        /// Reused batch id
        batch_id: i64,
        /// Read positions before it
        positions: PartitionOffsets,
    },
}

/// Latest checkpoint entries, enough to decide how to resume.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    /// Latest offsets entry
    pub latest_offsets: Option<OffsetsEntry>,
    /// Whether that entry has a commit marker
    pub latest_committed: bool,
}

impl CheckpointState {
    /// Decide how to resume given the last batch id the table records for this query.
    pub fn resolve(&self, table_app_version: Option<i64>) -> RecoveryDecision {
        let Some(ref latest) = self.latest_offsets else {
            return RecoveryDecision::Fresh;
        };

        if self.latest_committed {
            if table_app_version.map_or(true, |v| v < latest.batch_id) {
                warn!(
                    batch_id = latest.batch_id,
                    table_app_version = ?table_app_version,
                    "Checkpoint marks a batch committed that the table does not record"
                );
            }
            return RecoveryDecision::Resume {
                next_batch_id: latest.batch_id + 1,
                positions: latest.end.clone(),
            };
        }

        match table_app_version {
            Some(v) if v >= latest.batch_id => RecoveryDecision::CompleteCommit {
                batch_id: latest.batch_id,
                record_count: latest.record_count,
                positions: latest.end.clone(),
            },
            _ => RecoveryDecision::Replan {
                batch_id: latest.batch_id,
                positions: latest.start.clone(),
            },
        }
    }
}

/// Where the query continues.
#[derive(Debug, Clone)]
pub struct RecoveredState {
    /// Query metadata
    pub metadata: CheckpointMetadata,
    /// Id the next batch will use
    pub next_batch_id: i64,
    /// Read positions; `None` until the starting offsets are resolved
    pub positions: Option<PartitionOffsets>,
    /// Decision taken
    pub decision: RecoveryDecision,
}

impl RecoveredState {
    /// True when no batch was ever planned.
    pub fn is_fresh(&self) -> bool {
        matches!(self.decision, RecoveryDecision::Fresh)
    }
}

impl CheckpointStore {
    /// Read the latest checkpoint entries.
    pub async fn state(&self) -> Result<CheckpointState> {
        let latest_offsets = self.latest_offsets().await?;
        let latest_committed = match latest_offsets {
            Some(ref entry) => self.read_commit(entry.batch_id).await?.is_some(),
            None => false,
        };
        Ok(CheckpointState {
            latest_offsets,
            latest_committed,
        })
    }

    /// Resolve where to continue and write any missing commit marker.
    pub async fn recover(
        &self,
        metadata: CheckpointMetadata,
        table_app_version: Option<i64>,
        table_version: Option<i64>,
    ) -> Result<RecoveredState> {
        let decision = self.state().await?.resolve(table_app_version);

        let (next_batch_id, positions) = match decision {
            RecoveryDecision::Fresh => (
                0,
                self.read_initial_offsets().await?.map(|initial| initial.positions),
            ),
            RecoveryDecision::Resume {
                next_batch_id,
                ref positions,
            } => (next_batch_id, Some(positions.clone())),
            RecoveryDecision::CompleteCommit {
                batch_id,
                record_count,
                ref positions,
            } => {
                self.write_commit(&CommitEntry {
                    batch_id,
                    table_version,
                    record_count,
                    recovered: true,
                    committed_at: chrono::Utc::now(),
                })
                .await?;
                info!(
                    batch_id = batch_id,
                    "Batch found in table after restart, commit marker written"
                );
                (batch_id + 1, Some(positions.clone()))
            }
            RecoveryDecision::Replan {
                batch_id,
                ref positions,
            } => {
                warn!(
                    batch_id = batch_id,
                    "Batch planned but not in table, reprocessing from its start offsets"
                );
                (batch_id, Some(positions.clone()))
            }
        };

        info!(
            query_id = %metadata.id,
            next_batch_id = next_batch_id,
            fresh = positions.is_none(),
            "Checkpoint recovery complete"
        );

        Ok(RecoveredState {
            metadata,
            next_batch_id,
            positions,
            decision,
        })
    }
}
