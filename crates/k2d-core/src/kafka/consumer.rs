//! Kafka record source with exponential backoff on metadata calls.
//!
//! Partitions are assigned manually from checkpointed positions; the consumer
//! never subscribes and never commits offsets to the broker.
//!
//! ## Exponential Backoff
//!
//! Metadata and watermark requests are retried with backoff:
//! min(max_delay, base_delay * 2^attempt) + jitter
//!
//! Poll errors are classified here and retried by the streaming query, which
//! owns the source between attempts.

use super::options::KafkaSourceOptions;
use crate::source::{KafkaRecord, PartitionOffsets, PartitionWatermarks, RecordSource};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError as RdKafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (default: 100ms)
    pub base_delay: Duration,
    /// Maximum delay cap (default: 30s)
    pub max_delay: Duration,
    /// Maximum number of retries (default: 10)
    pub max_retries: u32,
    /// Whether to add jitter (randomness) to delays (default: true)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    ///
    /// Adds ±25% jitter when enabled.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let capped_ms = base_ms.saturating_mul(1u64 << attempt.min(20)).min(max_ms);

        let final_ms = if self.jitter {
            let jitter_range = capped_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }

    /// Run `op` until it succeeds or `max_retries` attempts have failed.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        warn!(
                            operation = what,
                            attempt = attempt,
                            error = %e,
                            "Giving up after max retries"
                        );
                        return Err(e);
                    }
                    let delay = self.calculate_delay(attempt);
                    warn!(
                        operation = what,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Kafka-backed [`RecordSource`].
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    bootstrap_servers: String,
    metadata_timeout: Duration,
    retry_config: RetryConfig,
}

impl KafkaSource {
    /// Create the consumer. No partitions are assigned until [`RecordSource::assign`].
    pub fn new(options: &KafkaSourceOptions, metadata_timeout: Duration) -> Result<Self> {
        let consumer: StreamConsumer = options.client_config().create().map_err(|e| {
            Error::Kafka(KafkaError::ConnectionFailed {
                broker: options.bootstrap_servers().to_string(),
                message: e.to_string(),
            })
        })?;

        info!(
            topic = %options.topic(),
            servers = %options.bootstrap_servers(),
            "Kafka consumer created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: options.topic().to_string(),
            bootstrap_servers: options.bootstrap_servers().to_string(),
            metadata_timeout,
            retry_config: RetryConfig::default(),
        })
    }

    /// Set custom retry configuration.
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Broker list this source connects to.
    pub fn bootstrap_servers(&self) -> &str {
        &self.bootstrap_servers
    }

    async fn fetch_partitions(&self) -> Result<Vec<i32>> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let timeout = self.metadata_timeout;

        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&topic), timeout)
                .map_err(|e| metadata_error(&topic, e.to_string()))?;
            let topic_metadata = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .ok_or_else(|| metadata_error(&topic, "topic not found".into()))?;
            if let Some(err) = topic_metadata.error() {
                return Err(metadata_error(&topic, format!("{:?}", err)));
            }
            let mut partitions: Vec<i32> =
                topic_metadata.partitions().iter().map(|p| p.id()).collect();
            partitions.sort_unstable();
            Ok(partitions)
        })
        .await
        .map_err(|e| metadata_error(&self.topic, e.to_string()))?
    }

    async fn fetch_watermarks(&self, partition: i32) -> Result<PartitionWatermarks> {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        let timeout = self.metadata_timeout;

        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_watermarks(&topic, partition, timeout)
                .map(|(low, high)| PartitionWatermarks { low, high })
                .map_err(|e| metadata_error(&topic, format!("partition {}: {}", partition, e)))
        })
        .await
        .map_err(|e| metadata_error(&self.topic, e.to_string()))?
    }

    /// Convert a borrowed message to an owned record.
    fn convert_message(msg: &BorrowedMessage) -> KafkaRecord {
        KafkaRecord {
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|v| v.to_vec()),
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis().unwrap_or(0),
            headers: Self::extract_headers(msg),
        }
    }

    /// Extract headers from a message.
    fn extract_headers(msg: &BorrowedMessage) -> Vec<(String, Vec<u8>)> {
        msg.headers()
            .map(|headers| {
                (0..headers.count())
                    .map(|i| {
                        let header = headers.get(i);
                        (header.key.to_string(), header.value.unwrap_or(&[]).to_vec())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Map a consumption error to a transient or a fatal poll error.
fn poll_error(err: &RdKafkaError) -> Error {
    let transient = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::Resolve
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
        )
    );
    if transient {
        Error::Kafka(KafkaError::Transient(err.to_string()))
    } else {
        Error::Kafka(KafkaError::Poll(err.to_string()))
    }
}

fn metadata_error(topic: &str, message: String) -> Error {
    Error::Kafka(KafkaError::Metadata {
        topic: topic.to_string(),
        message,
    })
}

#[async_trait]
impl RecordSource for KafkaSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn partitions(&self) -> Result<Vec<i32>> {
        self.retry_config
            .retry("fetch_metadata", || self.fetch_partitions())
            .await
    }

    async fn watermarks(&self, partition: i32) -> Result<PartitionWatermarks> {
        self.retry_config
            .retry("fetch_watermarks", || self.fetch_watermarks(partition))
            .await
    }

    async fn assign(&mut self, positions: &PartitionOffsets) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (&partition, &offset) in positions {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset))
                .map_err(|e| Error::Kafka(KafkaError::PartitionAssignment(e.to_string())))?;
        }

        self.consumer
            .assign(&tpl)
            .map_err(|e| Error::Kafka(KafkaError::PartitionAssignment(e.to_string())))?;

        debug!(
            topic = %self.topic,
            positions = ?positions,
            "Partitions assigned"
        );
        Ok(())
    }

    async fn poll_batch(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<KafkaRecord>> {
        use futures::StreamExt;

        let mut batch = Vec::with_capacity(max_records.min(1024));
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        // Wait up to `timeout` for the first record, then drain what is
        // already fetched without waiting.
        let mut wait = timeout;
        while batch.len() < max_records {
            match tokio::time::timeout(wait, stream.next()).await {
                Ok(Some(Ok(msg))) => {
                    batch.push(Self::convert_message(&msg));
                    wait = Duration::from_millis(1);
                }
                Ok(Some(Err(e))) => return Err(poll_error(&e)),
                Ok(None) => return Err(Error::Kafka(KafkaError::ConsumerClosed)),
                Err(_) => break,
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_poll_error_classification() {
        for code in [
            RDKafkaErrorCode::AllBrokersDown,
            RDKafkaErrorCode::BrokerTransportFailure,
            RDKafkaErrorCode::NotLeaderForPartition,
        ] {
            assert!(poll_error(&RdKafkaError::MessageConsumption(code)).is_transient());
        }

        let err = poll_error(&RdKafkaError::MessageConsumption(
            RDKafkaErrorCode::TopicAuthorizationFailed,
        ));
        assert!(matches!(err, Error::Kafka(KafkaError::Poll(_))));
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 10);
        assert!(config.jitter);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(1), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(10), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(750), "delay {:?}", delay);
        assert!(delay <= Duration::from_millis(1250), "delay {:?}", delay);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 5)
            .without_jitter();
        let calls = AtomicU32::new(0);

        let result = config
            .retry("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Kafka(KafkaError::Timeout("metadata".into())))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(2), 3)
            .without_jitter();
        let calls = AtomicU32::new(0);

        let result: Result<()> = config
            .retry("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Kafka(KafkaError::Timeout("metadata".into())))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
