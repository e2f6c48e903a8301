//! In-process topic for tests.

use super::{KafkaRecord, PartitionOffsets, PartitionWatermarks, RecordSource};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const IDLE_POLL_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct MemoryPartition {
    /// Offset of `records[0]`
    base_offset: i64,
    records: Vec<Option<Vec<u8>>>,
}

impl MemoryPartition {
    fn high(&self) -> i64 {
        self.base_offset + self.records.len() as i64
    }
}

#[derive(Debug, Default)]
struct MemoryTopic {
    partitions: BTreeMap<i32, MemoryPartition>,
    fail_next_poll: Option<KafkaError>,
}

/// In-memory topic, shared by all clones.
///
/// Producing to a clone is visible to a source already handed to a query.
#[derive(Debug, Clone)]
pub struct MemorySource {
    topic: String,
    state: Arc<Mutex<MemoryTopic>>,
    positions: PartitionOffsets,
}

impl MemorySource {
    /// Create a topic with `partitions` empty partitions.
    pub fn new(topic: impl Into<String>, partitions: i32) -> Self {
        let state = MemoryTopic {
            partitions: (0..partitions)
                .map(|p| (p, MemoryPartition::default()))
                .collect(),
            fail_next_poll: None,
        };
        Self {
            topic: topic.into(),
            state: Arc::new(Mutex::new(state)),
            positions: PartitionOffsets::new(),
        }
    }

    /// Append a record and return its offset.
    pub fn produce(&self, partition: i32, value: Option<&[u8]>) -> i64 {
        let mut state = self.state.lock();
        let part = state.partitions.entry(partition).or_default();
        part.records.push(value.map(<[u8]>::to_vec));
        part.high() - 1
    }

    /// Add a partition, as a topic scale-out would.
    pub fn add_partition(&self, partition: i32) {
        self.state.lock().partitions.entry(partition).or_default();
    }

    /// Drop records below `offset`, as retention would.
    pub fn truncate_before(&self, partition: i32, offset: i64) {
        let mut state = self.state.lock();
        if let Some(part) = state.partitions.get_mut(&partition) {
            let drop = (offset - part.base_offset).clamp(0, part.records.len() as i64);
            part.records.drain(..drop as usize);
            part.base_offset += drop;
        }
    }

    /// Make the next poll fail with the given message.
    pub fn fail_next_poll(&self, message: impl Into<String>) {
        self.state.lock().fail_next_poll = Some(KafkaError::Poll(message.into()));
    }

    /// Make the next poll fail with a transient broker error.
    pub fn interrupt_next_poll(&self, message: impl Into<String>) {
        self.state.lock().fail_next_poll = Some(KafkaError::Transient(message.into()));
    }

    /// Current read positions.
    pub fn positions(&self) -> &PartitionOffsets {
        &self.positions
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn partitions(&self) -> Result<Vec<i32>> {
        Ok(self.state.lock().partitions.keys().copied().collect())
    }

    async fn watermarks(&self, partition: i32) -> Result<PartitionWatermarks> {
        let state = self.state.lock();
        let part = state.partitions.get(&partition).ok_or_else(|| {
            Error::Kafka(KafkaError::Metadata {
                topic: self.topic.clone(),
                message: format!("unknown partition {}", partition),
            })
        })?;
        Ok(PartitionWatermarks {
            low: part.base_offset,
            high: part.high(),
        })
    }

    async fn assign(&mut self, positions: &PartitionOffsets) -> Result<()> {
        self.positions = positions.clone();
        Ok(())
    }

    async fn poll_batch(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<KafkaRecord>> {
        let batch = self.read_available(max_records)?;
        if batch.is_empty() {
            // Stand-in for the broker's fetch wait
            tokio::time::sleep(timeout.min(IDLE_POLL_WAIT)).await;
        }
        Ok(batch)
    }
}

impl MemorySource {
    fn read_available(&mut self, max_records: usize) -> Result<Vec<KafkaRecord>> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_poll.take() {
            return Err(Error::Kafka(err));
        }

        let mut batch = Vec::new();
        for (partition, position) in self.positions.iter_mut() {
            let Some(part) = state.partitions.get(partition) else {
                continue;
            };
            // Reset to earliest when the position fell off the retained range
            if *position < part.base_offset {
                *position = part.base_offset;
            }
            while *position < part.high() && batch.len() < max_records {
                let index = (*position - part.base_offset) as usize;
                batch.push(KafkaRecord {
                    key: None,
                    value: part.records[index].clone(),
                    topic: self.topic.clone(),
                    partition: *partition,
                    offset: *position,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    headers: Vec::new(),
                });
                *position += 1;
            }
        }
        Ok(batch)
    }
}
