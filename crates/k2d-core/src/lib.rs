//! K2D Core - Kafka / Event Hubs to Delta bronze ingestion
//!
//! This library streams records from a Kafka-compatible topic (including
//! Azure Event Hubs' Kafka endpoint) into an append-only Delta table with a
//! single `raw_json` string column:
//!
//! - Literal Event Hubs SASL options and user `kafka.*` overrides
//! - Lossless payload projection (invalid UTF-8 is replaced, never dropped)
//! - Exactly-once micro-batches through a write-ahead checkpoint and the
//!   Delta `txn` action
//! - Azure (`abfss://`), S3 and local storage via `object_store`

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod projection;
pub mod secret;
pub mod source;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use engine::{BatchReport, QueryStatus, StreamingQuery};
pub use error::{BufferError, CheckpointError, DeltaError, KafkaError};
pub use error::{Error, Result};
pub use source::{KafkaRecord, PartitionOffsets, RecordSource};

#[cfg(any(test, feature = "test-util"))]
pub use source::MemorySource;
