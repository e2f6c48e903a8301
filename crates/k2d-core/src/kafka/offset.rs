//! Starting positions, data-loss detection and lag tracking.

use crate::config::StartingOffsets;
use crate::source::{PartitionOffsets, PartitionWatermarks};
use crate::{Error, KafkaError, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Half-open offset range `[start, end)` read from one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetRange {
    /// Partition number
    pub partition: i32,
    /// First offset of the range
    pub start: i64,
    /// One past the last offset read
    pub end: i64,
}

impl OffsetRange {
    /// Number of offsets spanned (records, unless the log has gaps).
    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    /// True when nothing was read.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A checkpointed position that the broker no longer serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLossEvent {
    /// Partition number
    pub partition: i32,
    /// Position recorded in the checkpoint (None when the partition vanished)
    pub expected: Option<i64>,
    /// Position reading resumes from (None when the partition is dropped)
    pub resumed_at: Option<i64>,
    /// Human-readable cause
    pub reason: String,
}

/// Resolved read positions plus any tolerated data loss.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentPlan {
    /// Next offset to read, per partition
    pub positions: PartitionOffsets,
    /// Out-of-range checkpoint positions that were reset
    pub data_loss: Vec<DataLossEvent>,
}

/// Decide where each partition starts reading.
///
/// * No checkpointed positions: `starting` picks the low or high watermark.
/// * Checkpointed position outside `[low, high]`: data loss. Tolerated by
///   resuming at `low`, or fails when `fail_on_data_loss` is set.
/// * Partition absent from the checkpoint (added later): read from `low`.
/// * Checkpointed partition missing from the topic: data loss, dropped.
pub fn plan_assignment(
    topic: &str,
    watermarks: &BTreeMap<i32, PartitionWatermarks>,
    checkpointed: Option<&PartitionOffsets>,
    starting: StartingOffsets,
    fail_on_data_loss: bool,
) -> Result<AssignmentPlan> {
    let mut plan = AssignmentPlan::default();

    let Some(checkpointed) = checkpointed else {
        for (&partition, wm) in watermarks {
            let position = match starting {
                StartingOffsets::Earliest => wm.low,
                StartingOffsets::Latest => wm.high,
            };
            plan.positions.insert(partition, position);
        }
        return Ok(plan);
    };

    for (&partition, wm) in watermarks {
        match checkpointed.get(&partition) {
            Some(&offset) if wm.contains(offset) => {
                plan.positions.insert(partition, offset);
            }
            Some(&offset) => {
                let reason = if offset < wm.low {
                    format!(
                        "offset {} is below the earliest available offset {}; records were aged out",
                        offset, wm.low
                    )
                } else {
                    format!(
                        "offset {} is beyond the latest offset {}; the topic may have been recreated",
                        offset, wm.high
                    )
                };
                if fail_on_data_loss {
                    return Err(data_loss(topic, partition, reason));
                }
                plan.positions.insert(partition, wm.low);
                plan.data_loss.push(DataLossEvent {
                    partition,
                    expected: Some(offset),
                    resumed_at: Some(wm.low),
                    reason,
                });
            }
            None => {
                plan.positions.insert(partition, wm.low);
            }
        }
    }

    for (&partition, &offset) in checkpointed {
        if watermarks.contains_key(&partition) {
            continue;
        }
        let reason = format!("partition {} no longer exists", partition);
        if fail_on_data_loss {
            return Err(data_loss(topic, partition, reason));
        }
        plan.data_loss.push(DataLossEvent {
            partition,
            expected: Some(offset),
            resumed_at: None,
            reason,
        });
    }

    Ok(plan)
}

fn data_loss(topic: &str, partition: i32, message: String) -> Error {
    Error::Kafka(KafkaError::DataLoss {
        topic: topic.to_string(),
        partition,
        message,
    })
}

/// Per-partition committed positions and high watermarks, shared with the
/// HTTP status endpoint.
pub struct OffsetTracker {
    /// Next offset to read after the last committed batch
    committed: DashMap<i32, AtomicI64>,

    /// Last observed high watermark
    high_watermarks: DashMap<i32, AtomicI64>,
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self {
            committed: DashMap::new(),
            high_watermarks: DashMap::new(),
        }
    }

    fn store(map: &DashMap<i32, AtomicI64>, partition: i32, offset: i64) {
        map.entry(partition)
            .and_modify(|v| v.store(offset, Ordering::SeqCst))
            .or_insert_with(|| AtomicI64::new(offset));
    }

    /// Record the position after a committed batch.
    pub fn mark_committed(&self, partition: i32, offset: i64) {
        Self::store(&self.committed, partition, offset);
    }

    /// Record a freshly fetched high watermark.
    pub fn update_high_watermark(&self, partition: i32, offset: i64) {
        Self::store(&self.high_watermarks, partition, offset);
    }

    /// Get the committed position for a partition.
    pub fn get_committed(&self, partition: i32) -> Option<i64> {
        self.committed
            .get(&partition)
            .map(|v| v.load(Ordering::SeqCst))
    }

    /// Records behind the last observed high watermark.
    pub fn get_lag(&self, partition: i32) -> Option<i64> {
        let high = self
            .high_watermarks
            .get(&partition)
            .map(|v| v.load(Ordering::SeqCst))?;
        let committed = self.get_committed(partition)?;
        Some((high - committed).max(0))
    }

    /// Sum of lag across all partitions.
    pub fn total_lag(&self) -> i64 {
        let partitions: Vec<i32> = self.committed.iter().map(|entry| *entry.key()).collect();
        partitions.into_iter().filter_map(|p| self.get_lag(p)).sum()
    }

    /// Committed positions of every tracked partition.
    pub fn committed_positions(&self) -> PartitionOffsets {
        self.committed
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::SeqCst)))
            .collect()
    }
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watermarks(entries: &[(i32, i64, i64)]) -> BTreeMap<i32, PartitionWatermarks> {
        entries
            .iter()
            .map(|&(p, low, high)| (p, PartitionWatermarks { low, high }))
            .collect()
    }

    #[test]
    fn test_fresh_query_latest() {
        let wm = watermarks(&[(0, 5, 100), (1, 0, 42)]);
        let plan = plan_assignment("t", &wm, None, StartingOffsets::Latest, false).unwrap();
        assert_eq!(plan.positions, PartitionOffsets::from([(0, 100), (1, 42)]));
        assert!(plan.data_loss.is_empty());
    }

    #[test]
    fn test_fresh_query_earliest() {
        let wm = watermarks(&[(0, 5, 100)]);
        let plan = plan_assignment("t", &wm, None, StartingOffsets::Earliest, false).unwrap();
        assert_eq!(plan.positions[&0], 5);
    }

    #[test]
    fn test_resume_ignores_starting_offsets() {
        let wm = watermarks(&[(0, 0, 100), (1, 0, 100)]);
        let checkpointed = PartitionOffsets::from([(0, 40), (1, 100)]);
        let plan =
            plan_assignment("t", &wm, Some(&checkpointed), StartingOffsets::Latest, true).unwrap();
        assert_eq!(plan.positions, checkpointed);
    }

    #[test]
    fn test_aged_out_offset_tolerated() {
        let wm = watermarks(&[(0, 50, 100)]);
        let checkpointed = PartitionOffsets::from([(0, 10)]);
        let plan =
            plan_assignment("t", &wm, Some(&checkpointed), StartingOffsets::Latest, false).unwrap();

        assert_eq!(plan.positions[&0], 50);
        assert_eq!(plan.data_loss.len(), 1);
        assert_eq!(plan.data_loss[0].expected, Some(10));
        assert_eq!(plan.data_loss[0].resumed_at, Some(50));
    }

    #[test]
    fn test_aged_out_offset_fails_when_strict() {
        let wm = watermarks(&[(0, 50, 100)]);
        let checkpointed = PartitionOffsets::from([(0, 10)]);
        let err = plan_assignment("t", &wm, Some(&checkpointed), StartingOffsets::Latest, true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Kafka(KafkaError::DataLoss { partition: 0, .. })
        ));
    }

    #[test]
    fn test_offset_beyond_high_watermark() {
        let wm = watermarks(&[(0, 0, 20)]);
        let checkpointed = PartitionOffsets::from([(0, 500)]);
        let plan =
            plan_assignment("t", &wm, Some(&checkpointed), StartingOffsets::Latest, false).unwrap();
        assert_eq!(plan.positions[&0], 0);
        assert!(plan.data_loss[0].reason.contains("beyond"));
    }

    #[test]
    fn test_new_partition_starts_earliest() {
        let wm = watermarks(&[(0, 0, 100), (1, 7, 30)]);
        let checkpointed = PartitionOffsets::from([(0, 60)]);
        let plan =
            plan_assignment("t", &wm, Some(&checkpointed), StartingOffsets::Latest, true).unwrap();
        assert_eq!(plan.positions[&1], 7);
        assert!(plan.data_loss.is_empty());
    }

    #[test]
    fn test_vanished_partition() {
        let wm = watermarks(&[(0, 0, 100)]);
        let checkpointed = PartitionOffsets::from([(0, 60), (3, 12)]);

        let plan =
            plan_assignment("t", &wm, Some(&checkpointed), StartingOffsets::Latest, false).unwrap();
        assert!(!plan.positions.contains_key(&3));
        assert_eq!(plan.data_loss[0].partition, 3);
        assert_eq!(plan.data_loss[0].resumed_at, None);

        assert!(
            plan_assignment("t", &wm, Some(&checkpointed), StartingOffsets::Latest, true).is_err()
        );
    }

    #[test]
    fn test_offset_range() {
        let range = OffsetRange {
            partition: 0,
            start: 10,
            end: 15,
        };
        assert_eq!(range.len(), 5);
        assert!(!range.is_empty());
    }

    #[test]
    fn test_offset_tracker_lag() {
        let tracker = OffsetTracker::new();

        tracker.mark_committed(0, 50);
        assert_eq!(tracker.get_committed(0), Some(50));
        assert_eq!(tracker.get_lag(0), None);

        tracker.update_high_watermark(0, 80);
        assert_eq!(tracker.get_lag(0), Some(30));

        tracker.mark_committed(1, 10);
        tracker.update_high_watermark(1, 15);
        assert_eq!(tracker.total_lag(), 35);
        assert_eq!(tracker.committed_positions().len(), 2);
    }
}
