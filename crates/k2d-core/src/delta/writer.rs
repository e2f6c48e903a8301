//! Delta writer with idempotent, atomic appends.
//!
//! ## Write Flow
//!
//! 1. Skip the batch if the table already records it (`txn` for the query)
//! 2. Convert the Arrow RecordBatch to Parquet bytes
//! 3. Upload the data file to the table root
//! 4. Commit `add` + `txn` + `commitInfo` as the next log version with
//!    put-if-absent, retrying on conflict after re-reading the log

use super::actions::{raw_json_stats, Action, Add, CommitInfo, Txn};
use super::table::DeltaTable;
use crate::config::{ParquetCompression, SinkConfig};
use crate::{DeltaError, Error, Result};
use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::PutPayload;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Statistics from a committed append.
#[derive(Debug, Clone)]
pub struct CommitStats {
    /// Table version created
    pub version: i64,
    /// Number of rows written
    pub row_count: usize,
    /// Parquet file size in bytes
    pub file_size_bytes: usize,
    /// Data file path relative to the table root
    pub file_path: String,
    /// Commit attempts (1 without conflicts)
    pub attempts: u32,
    /// Time spent converting to Parquet
    pub parquet_conversion_duration: Duration,
    /// Time spent uploading to storage
    pub upload_duration: Duration,
    /// Time spent committing to the log
    pub commit_duration: Duration,
}

/// Result of [`DeltaWriter::append`].
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// A new version was committed
    Committed(CommitStats),
    /// The table already holds this batch; nothing was written
    AlreadyCommitted {
        /// Batch id the table records for the query
        app_version: i64,
        /// Current table version
        table_version: Option<i64>,
    },
}

impl AppendOutcome {
    /// Table version after the append.
    pub fn table_version(&self) -> Option<i64> {
        match self {
            AppendOutcome::Committed(stats) => Some(stats.version),
            AppendOutcome::AlreadyCommitted { table_version, .. } => *table_version,
        }
    }
}

/// Appends micro-batches to a Delta table.
pub struct DeltaWriter {
    table: DeltaTable,
    compression: ParquetCompression,
    max_row_group_size: usize,
    max_commit_retries: u32,
}

impl DeltaWriter {
    /// Create a writer for an opened table.
    pub fn new(table: DeltaTable, config: &SinkConfig) -> Self {
        Self {
            table,
            compression: config.compression,
            max_row_group_size: config.max_row_group_size,
            max_commit_retries: config.max_commit_retries.max(1),
        }
    }

    /// The table being written.
    pub fn table(&self) -> &DeltaTable {
        &self.table
    }

    /// Append `batch` as batch `batch_id` of application `app_id`.
    ///
    /// Replaying a batch id the table already records is a no-op.
    pub async fn append(
        &mut self,
        batch: &RecordBatch,
        app_id: &str,
        batch_id: i64,
    ) -> Result<AppendOutcome> {
        if let Some(outcome) = self.already_committed(app_id, batch_id) {
            return Ok(outcome);
        }

        let row_count = batch.num_rows();
        if row_count == 0 {
            return Err(Error::Delta(DeltaError::EmptyBatch));
        }

        // Step 1: Convert to Parquet
        let parquet_start = Instant::now();
        let parquet_bytes = self.convert_to_parquet(batch)?;
        let parquet_duration = parquet_start.elapsed();
        let file_size_bytes = parquet_bytes.len();

        // Step 2: Upload to object storage
        let file_path = self.generate_file_path();
        let upload_start = Instant::now();
        self.upload_file(&file_path, parquet_bytes).await?;
        let upload_duration = upload_start.elapsed();

        debug!(
            path = %file_path,
            rows = row_count,
            size_bytes = file_size_bytes,
            parquet_ms = parquet_duration.as_millis() as u64,
            upload_ms = upload_duration.as_millis() as u64,
            "Uploaded data file"
        );

        let null_count = batch
            .columns()
            .first()
            .map(|c| c.null_count())
            .unwrap_or(0);
        let add = Add {
            path: file_path.clone(),
            partition_values: HashMap::new(),
            size: file_size_bytes as i64,
            modification_time: chrono::Utc::now().timestamp_millis(),
            data_change: true,
            stats: Some(raw_json_stats(row_count, null_count)),
        };

        // Step 3: Commit, re-reading the log on conflict
        let commit_start = Instant::now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let now_ms = chrono::Utc::now().timestamp_millis();
            let version = self.table.snapshot().next_version();

            let mut actions = self.table.table_creation_actions(now_ms);
            actions.push(Action::Add(add.clone()));
            actions.push(Action::Txn(Txn {
                app_id: app_id.to_string(),
                version: batch_id,
                last_updated: Some(now_ms),
            }));
            actions.push(Action::CommitInfo(CommitInfo::streaming_append(
                now_ms, app_id, batch_id,
            )));

            match self.table.log().try_commit(version, &actions).await {
                Ok(()) => {
                    self.table.apply_commit(version, &actions);
                    let commit_duration = commit_start.elapsed();

                    info!(
                        version = version,
                        batch_id = batch_id,
                        rows = row_count,
                        file_size_mb = file_size_bytes as f64 / 1_000_000.0,
                        attempts = attempts,
                        commit_ms = commit_duration.as_millis() as u64,
                        "Batch appended to Delta table"
                    );

                    return Ok(AppendOutcome::Committed(CommitStats {
                        version,
                        row_count,
                        file_size_bytes,
                        file_path,
                        attempts,
                        parquet_conversion_duration: parquet_duration,
                        upload_duration,
                        commit_duration,
                    }));
                }
                Err(Error::Delta(DeltaError::CommitConflict { version })) => {
                    if attempts >= self.max_commit_retries {
                        return Err(Error::Delta(DeltaError::RetriesExhausted { attempts }));
                    }
                    warn!(
                        version = version,
                        attempt = attempts,
                        "Delta log version taken, re-reading log"
                    );
                    self.table.update().await?;
                    // The conflicting commit may be this batch, written by an
                    // earlier attempt whose response was lost.
                    if let Some(outcome) = self.already_committed(app_id, batch_id) {
                        return Ok(outcome);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn already_committed(&self, app_id: &str, batch_id: i64) -> Option<AppendOutcome> {
        let app_version = self.table.app_version(app_id)?;
        if app_version < batch_id {
            return None;
        }
        info!(
            batch_id = batch_id,
            app_version = app_version,
            "Batch already in table, skipping append"
        );
        Some(AppendOutcome::AlreadyCommitted {
            app_version,
            table_version: self.table.version(),
        })
    }

    /// Data file name in the table root.
    fn generate_file_path(&self) -> String {
        format!(
            "part-00000-{}-c000{}",
            Uuid::new_v4(),
            self.compression.file_suffix()
        )
    }

    /// Convert an Arrow RecordBatch to Parquet bytes.
    fn convert_to_parquet(&self, batch: &RecordBatch) -> Result<Bytes> {
        let mut buffer = Cursor::new(Vec::new());

        let compression = match self.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(Default::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
            ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        };

        let props = WriterProperties::builder()
            .set_compression(compression)
            .set_max_row_group_size(self.max_row_group_size)
            .set_write_batch_size(1024)
            .build();

        let mut writer =
            ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props)).map_err(|e| {
                Error::Delta(DeltaError::ParquetWrite(format!(
                    "Failed to create Parquet writer: {}",
                    e
                )))
            })?;

        writer.write(batch).map_err(|e| {
            Error::Delta(DeltaError::ParquetWrite(format!(
                "Failed to write batch to Parquet: {}",
                e
            )))
        })?;

        writer.close().map_err(|e| {
            Error::Delta(DeltaError::ParquetWrite(format!(
                "Failed to close Parquet writer: {}",
                e
            )))
        })?;

        Ok(Bytes::from(buffer.into_inner()))
    }

    /// Upload a file to object storage.
    async fn upload_file(&self, path: &str, data: Bytes) -> Result<()> {
        let object_path = ObjectPath::from(path);
        let payload = PutPayload::from_bytes(data);

        self.table
            .log()
            .store()
            .put(&object_path, payload)
            .await
            .map_err(|e| {
                Error::Delta(DeltaError::FileUpload(format!(
                    "Failed to upload file to {}: {}",
                    path, e
                )))
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::log::commit_path;
    use crate::projection::raw_json_schema;
    use arrow::array::StringArray;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::sync::Arc;

    fn sink_config() -> SinkConfig {
        SinkConfig {
            table_path: "memory".into(),
            compression: ParquetCompression::Snappy,
            max_row_group_size: 128 * 1024,
            max_commit_retries: 3,
        }
    }

    fn batch(values: &[Option<&str>]) -> RecordBatch {
        RecordBatch::try_new(
            raw_json_schema(),
            vec![Arc::new(StringArray::from(values.to_vec()))],
        )
        .unwrap()
    }

    async fn writer(store: Arc<dyn ObjectStore>) -> DeltaWriter {
        DeltaWriter::new(DeltaTable::open(store).await.unwrap(), &sink_config())
    }

    #[tokio::test]
    async fn test_first_append_creates_table() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut writer = writer(store.clone()).await;

        let outcome = writer
            .append(&batch(&[Some("{\"a\":1}"), None]), "query-1", 0)
            .await
            .unwrap();
        let AppendOutcome::Committed(stats) = outcome else {
            panic!("expected a commit");
        };
        assert_eq!(stats.version, 0);
        assert_eq!(stats.row_count, 2);
        assert!(stats.file_path.starts_with("part-00000-"));
        assert!(stats.file_path.ends_with("-c000.snappy.parquet"));

        let log = store.get(&commit_path(0)).await.unwrap().bytes().await.unwrap();
        let lines: Vec<serde_json::Value> = std::str::from_utf8(&log)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(lines[0].get("protocol").is_some());
        assert!(lines[1].get("metaData").is_some());
        assert_eq!(lines[2]["add"]["path"], stats.file_path.as_str());
        assert_eq!(lines[3]["txn"]["appId"], "query-1");
        assert_eq!(lines[3]["txn"]["version"], 0);
        assert_eq!(lines[4]["commitInfo"]["operation"], "STREAMING UPDATE");
        assert!(lines.iter().all(|l| l.get("remove").is_none()));

        // The data file holds exactly the input rows
        let data = store
            .get(&ObjectPath::from(stats.file_path.as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(data)
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn test_second_append_has_no_metadata() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut writer = writer(store.clone()).await;
        writer.append(&batch(&[Some("a")]), "q", 0).await.unwrap();
        let outcome = writer.append(&batch(&[Some("b")]), "q", 1).await.unwrap();
        assert_eq!(outcome.table_version(), Some(1));

        let log = store.get(&commit_path(1)).await.unwrap().bytes().await.unwrap();
        let text = std::str::from_utf8(&log).unwrap();
        assert!(!text.contains("metaData"));
        assert!(!text.contains("protocol"));
    }

    #[tokio::test]
    async fn test_replayed_batch_is_skipped() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut writer = writer(store.clone()).await;
        writer.append(&batch(&[Some("a")]), "q", 0).await.unwrap();
        writer.append(&batch(&[Some("b")]), "q", 1).await.unwrap();

        // A fresh writer sees the txn from the log
        let mut reopened = self::writer(store.clone()).await;
        let outcome = reopened.append(&batch(&[Some("b")]), "q", 1).await.unwrap();
        assert!(matches!(
            outcome,
            AppendOutcome::AlreadyCommitted {
                app_version: 1,
                table_version: Some(1)
            }
        ));
        assert_eq!(reopened.table().version(), Some(1));

        // Another query id is independent
        let outcome = reopened.append(&batch(&[Some("c")]), "other", 0).await.unwrap();
        assert_eq!(outcome.table_version(), Some(2));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_on_next_version() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut first = writer(store.clone()).await;
        let mut second = writer(store.clone()).await;

        first.append(&batch(&[Some("a")]), "q1", 0).await.unwrap();
        let outcome = second.append(&batch(&[Some("b")]), "q2", 0).await.unwrap();

        let AppendOutcome::Committed(stats) = outcome else {
            panic!("expected a commit");
        };
        assert_eq!(stats.version, 1);
        assert_eq!(stats.attempts, 2);
        assert_eq!(second.table().snapshot().num_records, 2);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let mut writer = writer(Arc::new(InMemory::new())).await;
        let err = writer.append(&batch(&[]), "q", 0).await.unwrap_err();
        assert!(matches!(err, Error::Delta(DeltaError::EmptyBatch)));
    }
}
