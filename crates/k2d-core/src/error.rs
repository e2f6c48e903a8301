//! Error types for k2d core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

/// Result type alias for k2d operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for k2d.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Micro-batch buffer error
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Delta table error
    #[error("Delta table error: {0}")]
    Delta(#[from] DeltaError),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,

    /// Buffered records were not committed before the shutdown deadline
    #[error("Final batch of {buffered} records not committed within {timeout:?}")]
    FlushTimeout {
        buffered: usize,
        timeout: std::time::Duration,
    },
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to create the client
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Topic metadata could not be fetched
    #[error("Metadata error for topic {topic}: {message}")]
    Metadata { topic: String, message: String },

    /// Partition assignment error
    #[error("Partition assignment error: {0}")]
    PartitionAssignment(String),

    /// Poll failed
    #[error("Poll error: {0}")]
    Poll(String),

    /// Poll failed on a broker condition that usually clears (transport,
    /// all brokers down, leader election, request timeout)
    #[error("Transient poll error: {0}")]
    Transient(String),

    /// Offsets recorded in the checkpoint are no longer available
    #[error("Data loss on {topic}[{partition}]: {message}")]
    DataLoss {
        topic: String,
        partition: i32,
        message: String,
    },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Consumer closed
    #[error("Consumer closed")]
    ConsumerClosed,
}

/// Micro-batch buffer errors.
#[derive(Error, Debug)]
pub enum BufferError {
    /// Arrow conversion error
    #[error("Arrow conversion error: {0}")]
    ArrowConversion(String),

    /// Record arrived for a partition before its start offset
    #[error("Record for partition {partition} at offset {offset} precedes position {position}")]
    OffsetRegression {
        partition: i32,
        offset: i64,
        position: i64,
    },
}

/// Delta table errors.
#[derive(Error, Debug)]
pub enum DeltaError {
    /// Parquet encoding failed
    #[error("Parquet write error: {0}")]
    ParquetWrite(String),

    /// Data file upload failed
    #[error("File upload error: {0}")]
    FileUpload(String),

    /// Another writer committed the same version first
    #[error("Commit conflict at version {version}")]
    CommitConflict { version: i64 },

    /// Commit gave up after repeated conflicts
    #[error("Commit failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// A log file could not be parsed
    #[error("Log corrupted at version {version}: {message}")]
    LogCorrupted { version: i64, message: String },

    /// Table schema is not the single raw_json column
    #[error("Schema mismatch: expected {expected}, actual {actual}")]
    SchemaMismatch { expected: String, actual: String },

    /// Table requires a newer protocol than this writer supports
    #[error("Unsupported protocol: reader {min_reader_version}, writer {min_writer_version}")]
    UnsupportedProtocol {
        min_reader_version: i32,
        min_writer_version: i32,
    },

    /// Empty batches are never committed
    #[error("Cannot write empty batch")]
    EmptyBatch,
}

/// Checkpoint errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// A checkpoint file could not be parsed
    #[error("Checkpoint file {path} corrupted: {message}")]
    Corrupted { path: String, message: String },

    /// Checkpoint write failed
    #[error("Checkpoint write failed: {0}")]
    WriteFailed(String),

    /// Checkpoint read failed
    #[error("Checkpoint read failed: {0}")]
    ReadFailed(String),

    /// The checkpoint belongs to a query reading another topic
    #[error("Checkpoint was created for topic {expected}, but configured topic is {actual}")]
    TopicMismatch { expected: String, actual: String },
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl Error {
    /// Short category label, used for metrics and exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Kafka(_) => "kafka",
            Error::Buffer(_) => "buffer",
            Error::Delta(_) => "delta",
            Error::Checkpoint(_) => "checkpoint",
            Error::Storage(_) | Error::Io(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Shutdown => "shutdown",
            Error::FlushTimeout { .. } => "runtime",
        }
    }

    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kafka(KafkaError::Transient(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let kafka_err = KafkaError::ConnectionFailed {
            broker: "ns.servicebus.windows.net:9093".into(),
            message: "connection refused".into(),
        };
        let err: Error = kafka_err.into();
        assert!(err.to_string().contains("Connection failed"));
        assert_eq!(err.kind(), "kafka");
    }

    #[test]
    fn test_data_loss_error() {
        let err = KafkaError::DataLoss {
            topic: "patient-flow".into(),
            partition: 3,
            message: "offset 10 below low watermark 42".into(),
        };
        assert_eq!(
            err.to_string(),
            "Data loss on patient-flow[3]: offset 10 below low watermark 42"
        );
    }

    #[test]
    fn test_transient_errors() {
        let err: Error = KafkaError::Transient("all brokers down".into()).into();
        assert!(err.is_transient());
        assert_eq!(err.kind(), "kafka");

        let err: Error = KafkaError::Poll("topic authorization failed".into()).into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_flush_timeout_error() {
        let err = Error::FlushTimeout {
            buffered: 12,
            timeout: std::time::Duration::from_secs(30),
        };
        assert_eq!(err.kind(), "runtime");
        assert_eq!(
            err.to_string(),
            "Final batch of 12 records not committed within 30s"
        );
    }

    #[test]
    fn test_delta_error() {
        let err: Error = DeltaError::CommitConflict { version: 7 }.into();
        assert!(err.to_string().contains("Commit conflict at version 7"));
        assert_eq!(err.kind(), "delta");
    }

    #[test]
    fn test_checkpoint_error() {
        let err = CheckpointError::TopicMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(err.to_string().contains("topic a"));
    }
}
