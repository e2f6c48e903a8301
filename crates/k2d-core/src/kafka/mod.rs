//! Kafka / Event Hubs source with exponential backoff.

mod consumer;
mod offset;
mod options;

pub use consumer::{KafkaSource, RetryConfig};
pub use offset::{plan_assignment, AssignmentPlan, DataLossEvent, OffsetRange, OffsetTracker};
pub use options::{
    starting_offsets_label, EventHubsConnection, KafkaSourceOptions, EVENT_HUBS_SASL_USERNAME,
};
