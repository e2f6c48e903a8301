//! Streaming query: source -> micro-batch -> Delta append -> checkpoint.
//!
//! ## Batch Flow
//!
//! 1. Poll the source until a trigger limit is reached
//! 2. Write the batch's offsets to the checkpoint (write-ahead)
//! 3. Append the rows to the table with `txn(query id, batch id)`
//! 4. Write the commit marker and advance the read positions
//!
//! Transient poll errors are retried with backoff. Any other failure stops
//! the query. On restart the checkpoint and the table's `txn` decide whether
//! the last batch is replayed or skipped.

use crate::buffer::{MicroBatch, MicroBatchBuffer};
use crate::checkpoint::{
    CheckpointStore, CommitEntry, InitialOffsets, OffsetsEntry, RecoveryDecision,
};
use crate::config::Config;
use crate::delta::{AppendOutcome, DeltaTable, DeltaWriter};
use crate::health::{
    HealthCheck, COMPONENT_BUFFER, COMPONENT_CHECKPOINT, COMPONENT_DELTA, COMPONENT_KAFKA,
    QUERY_COMPONENTS,
};
use crate::kafka::{plan_assignment, DataLossEvent, OffsetRange, OffsetTracker, RetryConfig};
use crate::metrics::{ErrorType, IngestionMetrics};
use crate::source::{KafkaRecord, PartitionOffsets, PartitionWatermarks, RecordSource};
use crate::storage::open_location;
use crate::{Error, KafkaError, Result};
use object_store::ObjectStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Upper bound on finishing the in-flight batch after shutdown is requested.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle of a [`StreamingQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// Created, not yet assigned
    Initializing,
    /// Reading and committing batches
    Running,
    /// Stopped after a shutdown request
    Stopped,
    /// Stopped by an error
    Failed(String),
}

/// Outcome of one micro-batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Batch id (the table's `txn` version for this query)
    pub batch_id: i64,
    /// Records read, equal to rows in the table
    pub record_count: usize,
    /// Table version holding the batch
    pub table_version: Option<i64>,
    /// True when the table already held the batch
    pub skipped: bool,
    /// Offsets covered, per partition
    pub ranges: Vec<OffsetRange>,
    /// Time from closing the batch to writing its commit marker
    pub duration: Duration,
}

/// State that exists once the query has recovered and been assigned.
struct ActiveQuery {
    query_id: String,
    writer: DeltaWriter,
    checkpoint: CheckpointStore,
    next_batch_id: i64,
    positions: PartitionOffsets,
    last_discovery: Instant,
}

/// A continuous query appending one topic to one Delta table.
pub struct StreamingQuery<S: RecordSource> {
    config: Config,
    source: S,
    buffer: MicroBatchBuffer,
    stores: Option<(Arc<dyn ObjectStore>, Arc<dyn ObjectStore>)>,
    active: Option<ActiveQuery>,
    status: QueryStatus,
    tracker: Arc<OffsetTracker>,
    metrics: Arc<IngestionMetrics>,
    health: Arc<HealthCheck>,
    poll_retry: RetryConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl<S: RecordSource> StreamingQuery<S> {
    /// Create a query reading `source` into the configured table.
    pub fn new(config: Config, source: S) -> Result<Self> {
        config.validate()?;

        let buffer = MicroBatchBuffer::new(&config.trigger);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            source,
            buffer,
            stores: None,
            active: None,
            status: QueryStatus::Initializing,
            tracker: Arc::new(OffsetTracker::new()),
            metrics: Arc::new(IngestionMetrics::new()),
            health: Arc::new(HealthCheck::for_query()),
            poll_retry: RetryConfig::default(),
            shutdown_tx,
        })
    }

    /// Use these stores for the table and checkpoint instead of opening the
    /// configured locations.
    pub fn with_stores(
        mut self,
        table: Arc<dyn ObjectStore>,
        checkpoint: Arc<dyn ObjectStore>,
    ) -> Self {
        self.stores = Some((table, checkpoint));
        self
    }

    /// Backoff for transient poll errors.
    pub fn with_poll_retry(mut self, retry: RetryConfig) -> Self {
        self.poll_retry = retry;
        self
    }

    /// Report into shared health and metrics, as served over HTTP.
    pub fn with_observability(
        mut self,
        health: Arc<HealthCheck>,
        metrics: Arc<IngestionMetrics>,
    ) -> Self {
        for name in QUERY_COMPONENTS {
            if health.get_component_status(name).is_none() {
                health.register_component(name);
            }
        }
        self.health = health;
        self.metrics = metrics;
        self
    }

    /// Recover from the checkpoint and assign the source partitions.
    ///
    /// Called by [`run`](Self::run) and [`run_once`](Self::run_once); a
    /// started query is left untouched.
    pub async fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn start_inner(&mut self) -> Result<()> {
        let (table_store, checkpoint_store) = match self.stores.take() {
            Some(stores) => stores,
            None => (
                open_location(&self.config.sink.table_path, &self.config.storage)?,
                open_location(&self.config.checkpoint.location, &self.config.storage)?,
            ),
        };

        let table = DeltaTable::open(table_store).await?;
        self.health.mark_healthy(COMPONENT_DELTA);
        if let Some(version) = table.version() {
            self.metrics.set_table_version(version);
        }

        let checkpoint = CheckpointStore::open(checkpoint_store);
        let topic = self.source.topic().to_string();
        let metadata = checkpoint.load_or_create_metadata(&topic).await?;
        let query_id = metadata.id.clone();
        let recovered = checkpoint
            .recover(metadata, table.app_version(&query_id), table.version())
            .await?;
        self.health.mark_healthy(COMPONENT_CHECKPOINT);

        let watermarks = self.fetch_watermarks().await?;
        let mut plan = plan_assignment(
            &topic,
            &watermarks,
            recovered.positions.as_ref(),
            self.config.source.starting_offsets,
            self.config.source.fail_on_data_loss,
        )?;

        // Pin the resolved starting offsets so a restart before the first
        // batch does not resolve `latest` again
        if recovered.positions.is_none() {
            let stored = checkpoint
                .write_initial_offsets(&InitialOffsets {
                    topic: topic.clone(),
                    positions: plan.positions.clone(),
                    created_at: chrono::Utc::now(),
                })
                .await?;
            if stored.positions != plan.positions {
                plan = plan_assignment(
                    &topic,
                    &watermarks,
                    Some(&stored.positions),
                    self.config.source.starting_offsets,
                    self.config.source.fail_on_data_loss,
                )?;
            }
        }

        self.source.assign(&plan.positions).await?;
        self.health.mark_healthy(COMPONENT_KAFKA);
        self.report_data_loss(&plan.data_loss);

        for (&partition, &offset) in &plan.positions {
            self.tracker.mark_committed(partition, offset);
        }
        self.metrics.set_consumer_lag(self.tracker.total_lag());
        self.buffer.open(&plan.positions);
        self.health.mark_healthy(COMPONENT_BUFFER);

        info!(
            query_id = %query_id,
            topic = %topic,
            next_batch_id = recovered.next_batch_id,
            partitions = plan.positions.len(),
            replan = matches!(recovered.decision, RecoveryDecision::Replan { .. }),
            "Streaming query started"
        );

        self.active = Some(ActiveQuery {
            query_id,
            writer: DeltaWriter::new(table, &self.config.sink),
            checkpoint,
            next_batch_id: recovered.next_batch_id,
            positions: plan.positions,
            last_discovery: Instant::now(),
        });
        self.status = QueryStatus::Running;
        Ok(())
    }

    async fn fetch_watermarks(&self) -> Result<BTreeMap<i32, PartitionWatermarks>> {
        let mut watermarks = BTreeMap::new();
        for partition in self.source.partitions().await? {
            let wm = self.source.watermarks(partition).await?;
            self.tracker.update_high_watermark(partition, wm.high);
            watermarks.insert(partition, wm);
        }
        Ok(watermarks)
    }

    fn report_data_loss(&self, events: &[DataLossEvent]) {
        if events.is_empty() {
            return;
        }
        for event in events {
            warn!(
                topic = %self.source.topic(),
                partition = event.partition,
                expected = ?event.expected,
                resumed_at = ?event.resumed_at,
                reason = %event.reason,
                "Data loss: records between the checkpoint and the resume offset were not read"
            );
        }
        self.metrics.record_data_loss(events.len());
        self.health.mark_degraded(
            COMPONENT_KAFKA,
            &format!("data loss on {} partition(s)", events.len()),
        );
    }

    /// Poll until the trigger fires and commit the batch.
    ///
    /// Returns `None` when no record arrived within one trigger interval.
    pub async fn run_once(&mut self) -> Result<Option<BatchReport>> {
        self.start().await?;
        if let Err(e) = self.fill_buffer().await {
            return Err(self.fail(e));
        }
        self.flush().await
    }

    /// Read records into the buffer until it should be flushed or the
    /// trigger interval ends.
    async fn fill_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            if let Some(ref active) = self.active {
                self.buffer.open(&active.positions);
            }
        }

        while !self.buffer.should_flush() {
            let remaining = self.buffer.time_remaining();
            if remaining.is_zero() {
                break;
            }

            let records = self
                .poll_with_retry(self.buffer.remaining_capacity(), remaining)
                .await?;
            if records.is_empty() {
                continue;
            }

            self.check_offset_gaps(&records).await?;
            for record in &records {
                self.buffer.append(record)?;
            }
            self.metrics.record_records(records.len() as u64);
            self.metrics
                .set_buffered(self.buffer.row_count(), self.buffer.memory_bytes());
        }
        Ok(())
    }

    async fn poll_with_retry(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<KafkaRecord>> {
        let mut attempt = 0;
        loop {
            match self.source.poll_batch(max_records, timeout).await {
                Ok(records) => {
                    if attempt > 0 {
                        info!(attempts = attempt, "Poll recovered after transient errors");
                        self.health.mark_healthy(COMPONENT_KAFKA);
                    }
                    return Ok(records);
                }
                Err(e) if e.is_transient() && attempt < self.poll_retry.max_retries => {
                    let delay = self.poll_retry.calculate_delay(attempt);
                    attempt += 1;
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient poll error, retrying with backoff"
                    );
                    self.metrics.record_error(ErrorType::Kafka);
                    self.health.mark_degraded(COMPONENT_KAFKA, &e.to_string());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Count records the consumer skipped because retention removed them
    /// while the query was reading.
    ///
    /// Compaction and transaction markers also leave offset gaps, so a gap
    /// only counts as loss when it starts below the partition's low watermark.
    async fn check_offset_gaps(&self, records: &[KafkaRecord]) -> Result<()> {
        let mut expected = self.buffer.end_positions().clone();
        let mut gaps = Vec::new();
        for record in records {
            if let Some(&next) = expected.get(&record.partition) {
                if record.offset > next {
                    gaps.push((record.partition, next, record.offset));
                }
            }
            expected.insert(record.partition, record.offset + 1);
        }

        let mut events = Vec::new();
        for (partition, next, resumed_at) in gaps {
            let wm = self.source.watermarks(partition).await?;
            if next >= wm.low {
                continue;
            }
            let reason = format!(
                "offsets {} to {} were aged out before they were read",
                next,
                resumed_at - 1
            );
            if self.config.source.fail_on_data_loss {
                return Err(Error::Kafka(KafkaError::DataLoss {
                    topic: self.source.topic().to_string(),
                    partition,
                    message: reason,
                }));
            }
            events.push(DataLossEvent {
                partition,
                expected: Some(next),
                resumed_at: Some(resumed_at),
                reason,
            });
        }
        self.report_data_loss(&events);
        Ok(())
    }

    /// Commit whatever is buffered as the next batch.
    async fn flush(&mut self) -> Result<Option<BatchReport>> {
        let batch = match self.buffer.take_batch() {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(None),
            Err(e) => return Err(self.fail(e)),
        };
        self.metrics.set_buffered(0, 0);

        match self.commit_batch(batch).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn commit_batch(&mut self, batch: MicroBatch) -> Result<BatchReport> {
        let started = Instant::now();
        let topic = self.source.topic().to_string();
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::Config("streaming query not started".into()))?;

        let batch_id = active.next_batch_id;
        let record_count = batch.record_count();

        active
            .checkpoint
            .write_offsets(&OffsetsEntry {
                batch_id,
                topic,
                start: batch.start.clone(),
                end: batch.end.clone(),
                record_count: record_count as u64,
                timestamp: chrono::Utc::now(),
            })
            .await?;

        let outcome = active
            .writer
            .append(&batch.batch, &active.query_id, batch_id)
            .await?;

        active
            .checkpoint
            .write_commit(&CommitEntry {
                batch_id,
                table_version: outcome.table_version(),
                record_count: record_count as u64,
                recovered: false,
                committed_at: chrono::Utc::now(),
            })
            .await?;

        active.next_batch_id = batch_id + 1;
        active.positions = batch.end.clone();

        let retain = self.config.checkpoint.min_batches_to_retain;
        if let Err(e) = active.checkpoint.purge(retain).await {
            warn!(error = %e, "Failed to purge old checkpoint entries");
        }

        let duration = started.elapsed();
        for (&partition, &offset) in &batch.end {
            self.tracker.mark_committed(partition, offset);
        }
        self.metrics.set_consumer_lag(self.tracker.total_lag());
        self.health.batch_committed(batch_id);
        for name in [COMPONENT_BUFFER, COMPONENT_DELTA, COMPONENT_CHECKPOINT] {
            self.health.mark_healthy(name);
        }

        let skipped = match outcome {
            AppendOutcome::Committed(ref stats) => {
                self.metrics.record_batch_committed(
                    stats.row_count,
                    stats.file_size_bytes,
                    stats.attempts.saturating_sub(1),
                    duration,
                );
                self.metrics.set_table_version(stats.version);
                false
            }
            AppendOutcome::AlreadyCommitted { app_version, .. } => {
                info!(
                    batch_id = batch_id,
                    app_version = app_version,
                    "Batch already in table, skipped"
                );
                self.metrics.record_batch_skipped();
                true
            }
        };

        let ranges = batch.ranges();
        debug!(
            batch_id = batch_id,
            records = record_count,
            nulls = batch.null_count,
            ranges = ?ranges,
            duration_ms = duration.as_millis() as u64,
            "Batch committed"
        );

        Ok(BatchReport {
            batch_id,
            record_count,
            table_version: outcome.table_version(),
            skipped,
            ranges,
            duration,
        })
    }

    /// Pick up partitions added to the topic and re-check positions against
    /// retention. Only runs between batches.
    pub async fn discover_partitions(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            return Ok(());
        }
        let Some(current) = self.active.as_ref().map(|a| a.positions.clone()) else {
            return Ok(());
        };

        let watermarks = self.fetch_watermarks().await?;
        self.metrics.set_consumer_lag(self.tracker.total_lag());

        let plan = plan_assignment(
            self.source.topic(),
            &watermarks,
            Some(&current),
            self.config.source.starting_offsets,
            self.config.source.fail_on_data_loss,
        )?;
        self.report_data_loss(&plan.data_loss);

        if plan.positions != current {
            let added: Vec<i32> = plan
                .positions
                .keys()
                .filter(|p| !current.contains_key(p))
                .copied()
                .collect();
            info!(
                partitions = plan.positions.len(),
                added = ?added,
                "Partition assignment changed"
            );
            self.source.assign(&plan.positions).await?;
            self.buffer.open(&plan.positions);
        }

        if let Some(active) = self.active.as_mut() {
            active.positions = plan.positions;
            active.last_discovery = Instant::now();
        }
        Ok(())
    }

    fn discovery_due(&self) -> bool {
        let interval = self.config.source.partition_discovery_interval_seconds;
        match self.active {
            Some(ref active) if interval > 0 => {
                active.last_discovery.elapsed() >= Duration::from_secs(interval)
            }
            _ => false,
        }
    }

    /// Run until shutdown is signalled or an error stops the query.
    ///
    /// Fails if the batch buffered at shutdown cannot be committed.
    pub async fn run(&mut self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let started = tokio::select! {
            _ = shutdown_rx.recv() => None,
            result = self.start() => Some(result),
        };
        match started {
            Some(result) => result?,
            None => {
                info!("Shutdown signal received before the query started");
                self.status = QueryStatus::Stopped;
                return Ok(());
            }
        }
        self.health.job_started();
        info!("Streaming query running");

        let result = self.run_loop(&mut shutdown_rx).await;
        self.health.job_completed();

        match result {
            Ok(()) => self.shutdown().await,
            Err(e) => {
                error!(error = %e, "Streaming query failed");
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<()> {
        loop {
            // Only the poll phase is cancelled by shutdown; a closed batch
            // always runs to its commit marker.
            let filled = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
                result = self.fill_buffer() => result,
            };
            if let Err(e) = filled {
                return Err(self.fail(e));
            }

            if let Some(report) = self.flush().await? {
                info!(
                    batch_id = report.batch_id,
                    records = report.record_count,
                    table_version = ?report.table_version,
                    skipped = report.skipped,
                    duration_ms = report.duration.as_millis() as u64,
                    "Micro-batch complete"
                );
            }

            if self.discovery_due() {
                if let Err(e) = self.discover_partitions().await {
                    return Err(self.fail(e));
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let buffered = self.buffer.row_count();
        info!(
            buffered = buffered,
            "Flushing buffered records before exit (30s timeout)"
        );

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.flush()).await {
            Ok(Ok(report)) => {
                if let Some(report) = report {
                    info!(
                        batch_id = report.batch_id,
                        records = report.record_count,
                        "Final batch committed"
                    );
                }
                self.status = QueryStatus::Stopped;
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Final flush failed; records resume from the checkpoint");
                Err(e)
            }
            Err(_) => {
                let err = Error::FlushTimeout {
                    buffered,
                    timeout: SHUTDOWN_TIMEOUT,
                };
                error!(error = %err, "Records resume from the checkpoint");
                Err(self.fail(err))
            }
        }
    }

    /// Record a failure and return it.
    fn fail(&mut self, err: Error) -> Error {
        let component = match err {
            Error::Kafka(_) => COMPONENT_KAFKA,
            Error::Buffer(_) => COMPONENT_BUFFER,
            Error::Checkpoint(_) => COMPONENT_CHECKPOINT,
            _ => COMPONENT_DELTA,
        };
        self.health.mark_unhealthy(component, &err.to_string());
        self.metrics.record_error(ErrorType::from(&err));
        self.status = QueryStatus::Failed(err.to_string());
        err
    }

    /// Current status.
    pub fn status(&self) -> &QueryStatus {
        &self.status
    }

    /// Query id from the checkpoint, once started.
    pub fn query_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.query_id.as_str())
    }

    /// Id the next batch will use, once started.
    pub fn next_batch_id(&self) -> Option<i64> {
        self.active.as_ref().map(|a| a.next_batch_id)
    }

    /// Positions after the last committed batch, once started.
    pub fn positions(&self) -> Option<&PartitionOffsets> {
        self.active.as_ref().map(|a| &a.positions)
    }

    /// Latest Delta table version known to the writer.
    pub fn table_version(&self) -> Option<i64> {
        self.active.as_ref().and_then(|a| a.writer.table().version())
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<IngestionMetrics> {
        &self.metrics
    }

    /// Get health check.
    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Committed positions and lag per partition.
    pub fn offset_tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    /// Get shutdown signal sender.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// The source being read.
    pub fn source(&self) -> &S {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartingOffsets;
    use crate::health::ComponentStatus;
    use crate::source::MemorySource;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, PutMultipartOpts,
        PutOptions, PutPayload, PutResult,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store whose writes can be switched off.
    #[derive(Debug, Default)]
    struct FailingStore {
        inner: InMemory,
        fail_writes: AtomicBool,
    }

    impl std::fmt::Display for FailingStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FailingStore")
        }
    }

    #[async_trait]
    impl ObjectStore for FailingStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(object_store::Error::Generic {
                    store: "FailingStore",
                    source: "writes disabled".into(),
                });
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &Path,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    /// Source whose metadata calls never return, like a broker that is down.
    struct UnreachableSource;

    #[async_trait]
    impl RecordSource for UnreachableSource {
        fn topic(&self) -> &str {
            "events"
        }

        async fn partitions(&self) -> Result<Vec<i32>> {
            std::future::pending().await
        }

        async fn watermarks(&self, _partition: i32) -> Result<PartitionWatermarks> {
            std::future::pending().await
        }

        async fn assign(&mut self, _positions: &PartitionOffsets) -> Result<()> {
            Ok(())
        }

        async fn poll_batch(
            &mut self,
            _max_records: usize,
            _timeout: Duration,
        ) -> Result<Vec<KafkaRecord>> {
            Ok(Vec::new())
        }
    }

    fn config(extra: &str) -> Config {
        Config::from_toml_str(&format!(
            r#"
            [source]
            bootstrap_servers = ["localhost:9092"]
            topic = "events"
            starting_offsets = "earliest"
            {}

            [sink]
            table_path = "memory:///table"

            [checkpoint]
            location = "memory:///checkpoint"

            [trigger]
            max_records_per_batch = 100
            batch_timeout_ms = 20
            "#,
            extra
        ))
        .unwrap()
    }

    fn query(source: MemorySource, extra: &str) -> StreamingQuery<MemorySource> {
        StreamingQuery::new(config(extra), source)
            .unwrap()
            .with_stores(Arc::new(InMemory::new()), Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_run_once_commits_batch() {
        let source = MemorySource::new("events", 2);
        source.produce(0, Some(b"{\"a\":1}"));
        source.produce(0, None);
        source.produce(1, Some(b"{\"b\":2}"));

        let mut query = query(source.clone(), "");
        let report = query.run_once().await.unwrap().unwrap();

        assert_eq!(report.batch_id, 0);
        assert_eq!(report.record_count, 3);
        assert_eq!(report.table_version, Some(0));
        assert!(!report.skipped);
        assert_eq!(report.ranges.len(), 2);
        assert_eq!(query.status(), &QueryStatus::Running);
        assert_eq!(query.next_batch_id(), Some(1));
        assert_eq!(
            query.positions(),
            Some(&PartitionOffsets::from([(0, 2), (1, 1)]))
        );
        assert_eq!(query.metrics().rows_written(), 3);
        assert_eq!(query.health().report().last_batch_id, Some(0));

        // Nothing new within the trigger interval
        assert!(query.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let source = MemorySource::new("events", 1);
        source.produce(0, Some(b"old"));

        let mut query = query(source.clone(), "");
        query.config.source.starting_offsets = crate::config::StartingOffsets::Latest;
        query.start().await.unwrap();
        assert_eq!(query.positions(), Some(&PartitionOffsets::from([(0, 1)])));

        source.produce(0, Some(b"new"));
        let report = query.run_once().await.unwrap().unwrap();
        assert_eq!(report.record_count, 1);
        assert_eq!(report.ranges[0].start, 1);
    }

    #[tokio::test]
    async fn test_poll_failure_stops_query() {
        let source = MemorySource::new("events", 1);
        let mut query = query(source.clone(), "");
        query.start().await.unwrap();

        source.fail_next_poll("broker unavailable");
        let err = query.run_once().await.unwrap_err();

        assert!(matches!(err, Error::Kafka(KafkaError::Poll(_))));
        assert!(matches!(query.status(), QueryStatus::Failed(_)));
        assert!(matches!(
            query.health().get_component_status(COMPONENT_KAFKA),
            Some(ComponentStatus::Unhealthy(_))
        ));
        assert_eq!(query.metrics().errors_by_type(ErrorType::Kafka), 1);
    }

    #[tokio::test]
    async fn test_new_partition_read_from_earliest() {
        let source = MemorySource::new("events", 1);
        source.produce(0, Some(b"a"));

        let mut query = query(source.clone(), "");
        query.run_once().await.unwrap().unwrap();

        source.add_partition(1);
        source.produce(1, Some(b"b"));
        source.produce(1, Some(b"c"));
        query.discover_partitions().await.unwrap();
        assert_eq!(
            query.positions(),
            Some(&PartitionOffsets::from([(0, 1), (1, 0)]))
        );

        let report = query.run_once().await.unwrap().unwrap();
        assert_eq!(report.record_count, 2);
        assert_eq!(report.batch_id, 1);
    }

    #[tokio::test]
    async fn test_retention_gap_found_by_discovery() {
        let source = MemorySource::new("events", 1);
        source.produce(0, Some(b"a"));

        let mut query = query(source.clone(), "");
        query.run_once().await.unwrap().unwrap();

        for _ in 0..5 {
            source.produce(0, Some(b"x"));
        }
        source.truncate_before(0, 4);
        query.discover_partitions().await.unwrap();

        assert_eq!(query.metrics().data_loss_events(), 1);
        assert_eq!(query.positions(), Some(&PartitionOffsets::from([(0, 4)])));
        assert!(matches!(
            query.health().get_component_status(COMPONENT_KAFKA),
            Some(ComponentStatus::Degraded(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let source = MemorySource::new("events", 1);
        source.produce(0, Some(b"a"));

        let mut query = query(source, "");
        let shutdown = query.shutdown_signal();
        let handle = tokio::spawn(async move {
            let result = query.run().await;
            (result, query)
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(()).unwrap();

        let (result, query) = handle.await.unwrap();
        result.unwrap();
        assert_eq!(query.status(), &QueryStatus::Stopped);
        assert_eq!(query.metrics().rows_written(), 1);
        assert!(!query.health().is_job_running());
    }

    #[tokio::test]
    async fn test_latest_start_survives_restart_before_first_batch() {
        let source = MemorySource::new("events", 1);
        let table: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let checkpoint: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let latest = |source: MemorySource| {
            let mut config = config("");
            config.source.starting_offsets = StartingOffsets::Latest;
            StreamingQuery::new(config, source)
                .unwrap()
                .with_stores(Arc::clone(&table), Arc::clone(&checkpoint))
        };

        let mut first = latest(source.clone());
        first.start().await.unwrap();
        assert_eq!(first.positions(), Some(&PartitionOffsets::from([(0, 0)])));
        drop(first);

        for _ in 0..3 {
            source.produce(0, Some(b"while down"));
        }

        let mut second = latest(source.clone());
        second.start().await.unwrap();
        assert_eq!(second.positions(), Some(&PartitionOffsets::from([(0, 0)])));

        source.produce(0, Some(b"after restart"));
        let report = second.run_once().await.unwrap().unwrap();
        assert_eq!(report.record_count, 4);
        assert_eq!(report.ranges[0].start, 0);
        assert_eq!(report.ranges[0].end, 4);
    }

    #[tokio::test]
    async fn test_transient_poll_error_is_retried() {
        let source = MemorySource::new("events", 1);
        let mut query = query(source.clone(), "")
            .with_poll_retry(RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 3));
        query.start().await.unwrap();

        source.produce(0, Some(b"a"));
        source.interrupt_next_poll("leader election");
        let report = query.run_once().await.unwrap().unwrap();

        assert_eq!(report.record_count, 1);
        assert_eq!(query.status(), &QueryStatus::Running);
        assert_eq!(query.metrics().errors_by_type(ErrorType::Kafka), 1);
        assert_eq!(
            query.health().get_component_status(COMPONENT_KAFKA),
            Some(ComponentStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_transient_poll_error_fails_when_retries_exhausted() {
        let source = MemorySource::new("events", 1);
        let mut query = query(source.clone(), "")
            .with_poll_retry(RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 0));
        query.start().await.unwrap();

        source.interrupt_next_poll("all brokers down");
        let err = query.run_once().await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(query.status(), QueryStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_retention_gap_while_reading_counts_data_loss() {
        let source = MemorySource::new("events", 1);
        source.produce(0, Some(b"a"));

        let mut query = query(source.clone(), "");
        query.run_once().await.unwrap().unwrap();

        for _ in 0..5 {
            source.produce(0, Some(b"x"));
        }
        source.truncate_before(0, 4);

        let report = query.run_once().await.unwrap().unwrap();
        assert_eq!(report.record_count, 2);
        assert_eq!(report.ranges[0].start, 1);
        assert_eq!(report.ranges[0].end, 6);
        assert_eq!(query.metrics().data_loss_events(), 1);
        assert!(matches!(
            query.health().get_component_status(COMPONENT_KAFKA),
            Some(ComponentStatus::Degraded(_))
        ));
    }

    #[tokio::test]
    async fn test_retention_gap_while_reading_fails_when_strict() {
        let source = MemorySource::new("events", 1);
        source.produce(0, Some(b"a"));

        let mut query = query(source.clone(), "fail_on_data_loss = true");
        query.run_once().await.unwrap().unwrap();

        for _ in 0..5 {
            source.produce(0, Some(b"x"));
        }
        source.truncate_before(0, 4);

        let err = query.run_once().await.unwrap_err();
        assert!(matches!(err, Error::Kafka(KafkaError::DataLoss { partition: 0, .. })));
    }

    #[tokio::test]
    async fn test_failed_final_flush_fails_run() {
        let source = MemorySource::new("events", 1);
        let table = Arc::new(FailingStore::default());

        let mut config = config("");
        config.trigger.batch_timeout_ms = 60_000;
        let mut query = StreamingQuery::new(config, source.clone())
            .unwrap()
            .with_stores(table.clone(), Arc::new(InMemory::new()));
        let shutdown = query.shutdown_signal();
        let handle = tokio::spawn(async move {
            let result = query.run().await;
            (result, query)
        });

        source.produce(0, Some(b"buffered"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        table.fail_writes.store(true, Ordering::SeqCst);
        shutdown.send(()).unwrap();

        let (result, query) = handle.await.unwrap();
        assert!(result.is_err());
        assert!(matches!(query.status(), QueryStatus::Failed(_)));
        assert_eq!(query.metrics().rows_written(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_start() {
        let mut query = StreamingQuery::new(config(""), UnreachableSource)
            .unwrap()
            .with_stores(Arc::new(InMemory::new()), Arc::new(InMemory::new()));
        let shutdown = query.shutdown_signal();
        let handle = tokio::spawn(async move {
            let result = query.run().await;
            (result, query)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(()).unwrap();

        let (result, query) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        result.unwrap();
        assert_eq!(query.status(), &QueryStatus::Stopped);
        assert!(query.query_id().is_none());
        assert!(!query.health().is_job_running());
    }
}
