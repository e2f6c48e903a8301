//! Metrics exported on the `/metrics` endpoint.

mod prometheus;

pub use self::prometheus::{ErrorType, IngestionMetrics, METRICS_PREFIX};
