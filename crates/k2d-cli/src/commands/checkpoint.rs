//! Checkpoint command implementation.

use anyhow::Result;
use k2d_core::checkpoint::{CheckpointMetadata, CheckpointStore, OffsetsEntry};
use k2d_core::delta::DeltaTable;
use k2d_core::storage::open_location;
use k2d_core::{Config, PartitionOffsets};
use serde::Serialize;

/// What the checkpoint and the table say about the query.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointSummary {
    location: String,
    metadata: Option<CheckpointMetadata>,
    initial_offsets: Option<PartitionOffsets>,
    latest_batch: Option<OffsetsEntry>,
    latest_batch_committed: bool,
    table_version: Option<i64>,
    table_batch_id: Option<i64>,
}

/// Print the query id, last batch and its offsets.
pub async fn run(config: &Config, json: bool) -> Result<()> {
    let summary = inspect(config).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

async fn inspect(config: &Config) -> Result<CheckpointSummary> {
    let store = CheckpointStore::open(open_location(
        &config.checkpoint.location,
        &config.storage,
    )?);
    let metadata = store.load_metadata().await?;
    let initial_offsets = store
        .read_initial_offsets()
        .await?
        .map(|initial| initial.positions);
    let state = store.state().await?;

    let table = DeltaTable::open(open_location(&config.sink.table_path, &config.storage)?).await?;
    let table_batch_id = metadata
        .as_ref()
        .and_then(|m| table.app_version(&m.id));

    Ok(CheckpointSummary {
        location: config.checkpoint.location.clone(),
        metadata,
        initial_offsets,
        latest_batch: state.latest_offsets,
        latest_batch_committed: state.latest_committed,
        table_version: table.version(),
        table_batch_id,
    })
}

fn print_summary(summary: &CheckpointSummary) {
    println!("Checkpoint: {}", summary.location);

    let Some(ref metadata) = summary.metadata else {
        println!("No checkpoint yet; the next ingest starts a new query.");
        return;
    };
    println!("Query id:   {}", metadata.id);
    println!("Topic:      {}", metadata.topic);
    println!("Created:    {}", metadata.created_at);
    if let Some(ref positions) = summary.initial_offsets {
        println!("Started at: {:?}", positions);
    }

    match summary.latest_batch {
        Some(ref batch) => {
            println!(
                "Last batch: {} ({} records, {})",
                batch.batch_id,
                batch.record_count,
                if summary.latest_batch_committed {
                    "committed"
                } else {
                    "not committed"
                }
            );
            println!("Offsets:");
            for (partition, end) in &batch.end {
                let start = batch.start.get(partition).copied().unwrap_or(*end);
                println!("  partition {}: {} -> {}", partition, start, end);
            }
        }
        None => println!("Last batch: none"),
    }

    match (summary.table_version, summary.table_batch_id) {
        (Some(version), Some(batch_id)) => {
            println!("Table:      version {}, batch {} for this query", version, batch_id)
        }
        (Some(version), None) => {
            println!("Table:      version {}, no batch for this query", version)
        }
        _ => println!("Table:      not created"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2d_core::{MemorySource, StreamingQuery};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let root = dir.path().to_string_lossy().replace('\\', "/");
        toml::from_str(&format!(
            r#"
            [source]
            bootstrap_servers = ["localhost:9092"]
            topic = "events"
            starting_offsets = "earliest"

            [sink]
            table_path = "{root}/table"

            [checkpoint]
            location = "{root}/checkpoint"

            [trigger]
            batch_timeout_ms = 20
            "#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_inspect_empty_checkpoint() {
        let dir = TempDir::new().unwrap();
        let summary = inspect(&config(&dir)).await.unwrap();
        assert!(summary.metadata.is_none());
        assert!(summary.initial_offsets.is_none());
        assert!(summary.latest_batch.is_none());
        assert_eq!(summary.table_version, None);
    }

    #[tokio::test]
    async fn test_inspect_after_batch() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new("events", 2);
        source.produce(0, Some(b"{}"));
        source.produce(1, Some(b"{}"));

        let mut query = StreamingQuery::new(config(&dir), source).unwrap();
        query.run_once().await.unwrap().unwrap();

        let summary = inspect(&config(&dir)).await.unwrap();
        assert_eq!(
            summary.metadata.as_ref().map(|m| m.id.as_str()),
            query.query_id()
        );
        assert_eq!(
            summary.initial_offsets,
            Some(PartitionOffsets::from([(0, 0), (1, 0)]))
        );
        let batch = summary.latest_batch.unwrap();
        assert_eq!(batch.batch_id, 0);
        assert_eq!(batch.record_count, 2);
        assert!(summary.latest_batch_committed);
        assert_eq!(summary.table_version, Some(0));
        assert_eq!(summary.table_batch_id, Some(0));
    }
}
