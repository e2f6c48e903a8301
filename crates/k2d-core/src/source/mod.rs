//! Record source abstraction.
//!
//! The engine reads through [`RecordSource`] so that the Kafka consumer and
//! the in-memory source used by tests (feature `test-util`) are
//! interchangeable.

use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

#[cfg(any(test, feature = "test-util"))]
mod memory;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemorySource;

/// Next offset to read, per partition.
pub type PartitionOffsets = BTreeMap<i32, i64>;

/// One message from the source topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRecord {
    /// Message key (optional)
    pub key: Option<Vec<u8>>,

    /// Message payload (optional)
    pub value: Option<Vec<u8>>,

    /// Topic name
    pub topic: String,

    /// Partition number
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Message timestamp (milliseconds since epoch)
    pub timestamp: i64,

    /// Message headers
    pub headers: Vec<(String, Vec<u8>)>,
}

impl KafkaRecord {
    /// Estimated size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
            + self.topic.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
            + 24 // partition, offset, timestamp
    }
}

/// Earliest and latest available offsets of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWatermarks {
    /// First offset still retained
    pub low: i64,
    /// Offset the next produced record will get
    pub high: i64,
}

impl PartitionWatermarks {
    /// True when `offset` can still be read (the high watermark itself means "caught up").
    pub fn contains(&self, offset: i64) -> bool {
        offset >= self.low && offset <= self.high
    }
}

/// A partitioned, offset-addressed record stream.
#[async_trait]
pub trait RecordSource: Send {
    /// Topic this source reads.
    fn topic(&self) -> &str;

    /// Current partition ids of the topic.
    async fn partitions(&self) -> Result<Vec<i32>>;

    /// Low/high watermarks of a partition.
    async fn watermarks(&self, partition: i32) -> Result<PartitionWatermarks>;

    /// Replace the assignment, reading each partition from the given offset.
    async fn assign(&mut self, positions: &PartitionOffsets) -> Result<()>;

    /// Return up to `max_records` records, waiting at most `timeout` for the
    /// first one. An empty result means nothing is available right now.
    async fn poll_batch(&mut self, max_records: usize, timeout: Duration)
        -> Result<Vec<KafkaRecord>>;
}
