//! Prometheus metrics for the ingestion query.

use crate::Error;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tracing::warn;

/// Metric name prefix.
pub const METRICS_PREFIX: &str = "k2d";

/// Batch duration buckets in seconds.
const BATCH_DURATION_BUCKETS: [f64; 9] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Error categories for labeled metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Source errors (connection, metadata, poll, data loss)
    Kafka,
    /// Delta log and data file errors
    Delta,
    /// Checkpoint read or write errors
    Checkpoint,
    /// Object storage errors
    Storage,
    /// Buffer errors
    Buffer,
    /// Configuration errors
    Config,
    /// Anything else
    Other,
}

impl ErrorType {
    /// All categories, in label order.
    pub const ALL: [ErrorType; 7] = [
        ErrorType::Kafka,
        ErrorType::Delta,
        ErrorType::Checkpoint,
        ErrorType::Storage,
        ErrorType::Buffer,
        ErrorType::Config,
        ErrorType::Other,
    ];

    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorType::Kafka => "kafka",
            ErrorType::Delta => "delta",
            ErrorType::Checkpoint => "checkpoint",
            ErrorType::Storage => "storage",
            ErrorType::Buffer => "buffer",
            ErrorType::Config => "config",
            ErrorType::Other => "other",
        }
    }
}

impl From<&Error> for ErrorType {
    fn from(err: &Error) -> Self {
        match err {
            Error::Kafka(_) => ErrorType::Kafka,
            Error::Delta(_) => ErrorType::Delta,
            Error::Checkpoint(_) => ErrorType::Checkpoint,
            Error::Storage(_) | Error::Io(_) => ErrorType::Storage,
            Error::Buffer(_) => ErrorType::Buffer,
            Error::Config(_) => ErrorType::Config,
            Error::Serialization(_) | Error::Shutdown | Error::FlushTimeout { .. } => {
                ErrorType::Other
            }
        }
    }
}

/// Counters, gauges and histograms of one ingestion query.
pub struct IngestionMetrics {
    registry: Registry,

    records_consumed: IntCounter,
    rows_written: IntCounter,
    bytes_written: IntCounter,
    batches_committed: IntCounter,
    batches_skipped: IntCounter,
    commit_conflicts: IntCounter,
    data_loss_events: IntCounter,
    errors: IntCounterVec,

    buffered_rows: IntGauge,
    buffered_bytes: IntGauge,
    consumer_lag: IntGauge,
    table_version: IntGauge,

    batch_duration: Histogram,
}

impl IngestionMetrics {
    /// Create metrics in a fresh registry.
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
            .expect("static metric definitions register in an empty registry")
    }

    /// Create metrics registered in `registry`. Fails if the registry
    /// already holds metrics with the same names.
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let metrics = Self::build_with(registry)?;
        metrics.register()?;
        Ok(metrics)
    }

    fn build_with(registry: Registry) -> prometheus::Result<Self> {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).namespace(METRICS_PREFIX))
        };
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help).namespace(METRICS_PREFIX))
        };

        Ok(Self {
            records_consumed: counter(
                "records_consumed_total",
                "Records consumed from the stream",
            )?,
            rows_written: counter("rows_written_total", "Rows appended to the Delta table")?,
            bytes_written: counter(
                "bytes_written_total",
                "Parquet bytes uploaded to the table",
            )?,
            batches_committed: counter(
                "batches_committed_total",
                "Micro-batches committed to the Delta table",
            )?,
            batches_skipped: counter(
                "batches_skipped_total",
                "Micro-batches already present in the table and skipped",
            )?,
            commit_conflicts: counter(
                "commit_conflicts_total",
                "Delta commits retried after a concurrent writer",
            )?,
            data_loss_events: counter(
                "data_loss_events_total",
                "Partitions whose resume offset was no longer available",
            )?,
            errors: IntCounterVec::new(
                Opts::new("errors_total", "Errors by type").namespace(METRICS_PREFIX),
                &["type"],
            )?,
            buffered_rows: gauge("buffered_rows", "Rows in the open micro-batch")?,
            buffered_bytes: gauge("buffered_bytes", "Payload bytes in the open micro-batch")?,
            consumer_lag: gauge(
                "consumer_lag",
                "Records between committed positions and high watermarks",
            )?,
            table_version: gauge("table_version", "Latest Delta table version written")?,
            batch_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "batch_duration_seconds",
                    "Time to write, commit and checkpoint a micro-batch",
                )
                .namespace(METRICS_PREFIX)
                .buckets(BATCH_DURATION_BUCKETS.to_vec()),
            )?,
            registry,
        })
    }

    fn register(&self) -> prometheus::Result<()> {
        let r = &self.registry;
        r.register(Box::new(self.records_consumed.clone()))?;
        r.register(Box::new(self.rows_written.clone()))?;
        r.register(Box::new(self.bytes_written.clone()))?;
        r.register(Box::new(self.batches_committed.clone()))?;
        r.register(Box::new(self.batches_skipped.clone()))?;
        r.register(Box::new(self.commit_conflicts.clone()))?;
        r.register(Box::new(self.data_loss_events.clone()))?;
        r.register(Box::new(self.errors.clone()))?;
        r.register(Box::new(self.buffered_rows.clone()))?;
        r.register(Box::new(self.buffered_bytes.clone()))?;
        r.register(Box::new(self.consumer_lag.clone()))?;
        r.register(Box::new(self.table_version.clone()))?;
        r.register(Box::new(self.batch_duration.clone()))?;

        // Labelled series appear in the output from the start.
        for error_type in ErrorType::ALL {
            self.errors.with_label_values(&[error_type.as_label()]);
        }
        Ok(())
    }

    /// The registry holding these metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // === COUNTER RECORDING ===

    /// Record consumed records.
    pub fn record_records(&self, count: u64) {
        self.records_consumed.inc_by(count);
    }

    /// Record a committed batch.
    pub fn record_batch_committed(
        &self,
        rows: usize,
        bytes: usize,
        conflicts: u32,
        duration: Duration,
    ) {
        self.batches_committed.inc();
        self.rows_written.inc_by(rows as u64);
        self.bytes_written.inc_by(bytes as u64);
        self.commit_conflicts.inc_by(u64::from(conflicts));
        self.batch_duration.observe(duration.as_secs_f64());
    }

    /// Record a batch the table already held.
    pub fn record_batch_skipped(&self) {
        self.batches_skipped.inc();
    }

    /// Record data loss on `partitions` partitions.
    pub fn record_data_loss(&self, partitions: usize) {
        self.data_loss_events.inc_by(partitions as u64);
    }

    /// Record an error by category.
    pub fn record_error(&self, error_type: ErrorType) {
        self.errors.with_label_values(&[error_type.as_label()]).inc();
    }

    // === GAUGE SETTERS ===

    /// Set the size of the open micro-batch.
    pub fn set_buffered(&self, rows: usize, bytes: usize) {
        self.buffered_rows.set(rows as i64);
        self.buffered_bytes.set(bytes as i64);
    }

    /// Set total consumer lag across partitions.
    pub fn set_consumer_lag(&self, lag: i64) {
        self.consumer_lag.set(lag.max(0));
    }

    /// Set the latest table version.
    pub fn set_table_version(&self, version: i64) {
        self.table_version.set(version);
    }

    // === GETTERS ===

    /// Records consumed so far.
    pub fn records_consumed(&self) -> u64 {
        self.records_consumed.get()
    }

    /// Rows written so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.get()
    }

    /// Batches committed so far.
    pub fn batches_committed(&self) -> u64 {
        self.batches_committed.get()
    }

    /// Batches skipped as already committed.
    pub fn batches_skipped(&self) -> u64 {
        self.batches_skipped.get()
    }

    /// Data loss events so far.
    pub fn data_loss_events(&self) -> u64 {
        self.data_loss_events.get()
    }

    /// Errors of one category.
    pub fn errors_by_type(&self, error_type: ErrorType) -> u64 {
        self.errors.with_label_values(&[error_type.as_label()]).get()
    }

    /// Errors of all categories.
    pub fn errors_total(&self) -> u64 {
        ErrorType::ALL.iter().map(|t| self.errors_by_type(*t)).sum()
    }

    /// Rows in the open micro-batch.
    pub fn buffered_rows(&self) -> i64 {
        self.buffered_rows.get()
    }

    /// Current consumer lag.
    pub fn consumer_lag(&self) -> i64 {
        self.consumer_lag.get()
    }

    /// Batch duration observations so far.
    pub fn batch_duration_count(&self) -> u64 {
        self.batch_duration.get_sample_count()
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    ///
    /// ```
    /// use k2d_core::metrics::IngestionMetrics;
    ///
    /// let metrics = IngestionMetrics::new();
    /// metrics.record_records(3);
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("k2d_records_consumed_total 3"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::with_capacity(4096);
        if let Err(e) = TextEncoder::new().encode(&families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for IngestionMetrics {
    fn default() -> Self {
        Self::new()
    }
}
