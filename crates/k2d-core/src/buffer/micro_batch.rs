//! Arrow-backed micro-batch buffer.
//!
//! Projected rows go straight into an Arrow string builder while the buffer
//! tracks, per partition, the offsets the batch was read from.

use crate::config::TriggerConfig;
use crate::kafka::OffsetRange;
use crate::projection::{project, raw_json_schema};
use crate::source::{KafkaRecord, PartitionOffsets};
use crate::{BufferError, Error, Result};
use arrow::array::{Array, StringBuilder};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A closed micro-batch, ready to be appended to the table.
#[derive(Debug, Clone)]
pub struct MicroBatch {
    /// Projected rows
    pub batch: RecordBatch,
    /// Positions when the batch opened
    pub start: PartitionOffsets,
    /// Positions after the last record of the batch
    pub end: PartitionOffsets,
    /// Rows whose payload was null
    pub null_count: usize,
    /// Payload bytes buffered
    pub size_bytes: usize,
}

impl MicroBatch {
    /// Number of rows (equal to the number of records read).
    pub fn record_count(&self) -> usize {
        self.batch.num_rows()
    }

    /// Non-empty per-partition ranges covered by this batch.
    pub fn ranges(&self) -> Vec<OffsetRange> {
        self.end
            .iter()
            .map(|(&partition, &end)| OffsetRange {
                partition,
                start: self.start.get(&partition).copied().unwrap_or(end),
                end,
            })
            .filter(|range| !range.is_empty())
            .collect()
    }
}

/// Accumulates records until a trigger limit is reached.
pub struct MicroBatchBuffer {
    schema: SchemaRef,
    builder: StringBuilder,
    row_count: usize,
    memory_bytes: usize,
    start: PartitionOffsets,
    end: PartitionOffsets,
    opened_at: Instant,
    max_records: usize,
    max_bytes: usize,
    timeout: Duration,
}

impl MicroBatchBuffer {
    /// Create an empty buffer with trigger limits from `config`.
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            schema: raw_json_schema(),
            builder: StringBuilder::new(),
            row_count: 0,
            memory_bytes: 0,
            start: PartitionOffsets::new(),
            end: PartitionOffsets::new(),
            opened_at: Instant::now(),
            max_records: config.max_records_per_batch,
            max_bytes: config.max_batch_size_mb * 1_000_000,
            timeout: Duration::from_millis(config.batch_timeout_ms),
        }
    }

    /// Start a new batch at `positions`. Discards nothing; call on an empty buffer.
    pub fn open(&mut self, positions: &PartitionOffsets) {
        self.start = positions.clone();
        self.end = positions.clone();
        self.opened_at = Instant::now();
    }

    /// Project and append one record.
    pub fn append(&mut self, record: &KafkaRecord) -> Result<()> {
        let position = *self
            .end
            .entry(record.partition)
            .or_insert(record.offset);
        if record.offset < position {
            return Err(Error::Buffer(BufferError::OffsetRegression {
                partition: record.partition,
                offset: record.offset,
                position,
            }));
        }
        self.start.entry(record.partition).or_insert(record.offset);

        match project(record).raw_json {
            Some(text) => self.builder.append_value(text),
            None => self.builder.append_null(),
        }

        self.end.insert(record.partition, record.offset + 1);
        self.row_count += 1;
        self.memory_bytes += record.size_bytes();
        Ok(())
    }

    /// True when a size, count, or time limit is reached with rows buffered.
    pub fn should_flush(&self) -> bool {
        if self.row_count == 0 {
            return false;
        }
        self.row_count >= self.max_records
            || self.memory_bytes >= self.max_bytes
            || self.opened_at.elapsed() >= self.timeout
    }

    /// Time left before the batch must close.
    pub fn time_remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.opened_at.elapsed())
    }

    /// Records that still fit before the count limit.
    pub fn remaining_capacity(&self) -> usize {
        self.max_records.saturating_sub(self.row_count)
    }

    /// Get row count.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Get current memory usage.
    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    /// True when no rows are buffered.
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Positions after the last buffered record.
    pub fn end_positions(&self) -> &PartitionOffsets {
        &self.end
    }

    /// Close the batch and reopen at its end positions.
    pub fn take_batch(&mut self) -> Result<Option<MicroBatch>> {
        if self.row_count == 0 {
            return Ok(None);
        }

        let array = self.builder.finish();
        let null_count = array.null_count();
        let batch = RecordBatch::try_new(self.schema.clone(), vec![Arc::new(array)])
            .map_err(|e| Error::Buffer(BufferError::ArrowConversion(e.to_string())))?;

        let micro_batch = MicroBatch {
            batch,
            start: std::mem::take(&mut self.start),
            end: self.end.clone(),
            null_count,
            size_bytes: self.memory_bytes,
        };

        debug!(
            rows = self.row_count,
            bytes = self.memory_bytes,
            age_ms = self.opened_at.elapsed().as_millis() as u64,
            "Micro-batch closed"
        );

        self.row_count = 0;
        self.memory_bytes = 0;
        let end = self.end.clone();
        self.open(&end);

        Ok(Some(micro_batch))
    }
}
