//! Validate command implementation.

use anyhow::Result;
use k2d_core::kafka::{starting_offsets_label, KafkaSourceOptions};
use k2d_core::storage::{StorageCredentials, StorageLocation};
use k2d_core::Config;

/// Check the configuration, resolve secrets and print the effective settings
/// with credentials masked.
pub fn run(config: &Config) -> Result<()> {
    for line in summarize(config)? {
        println!("{}", line);
    }
    println!("\nConfiguration is valid");
    Ok(())
}

fn summarize(config: &Config) -> Result<Vec<String>> {
    config.validate()?;
    let options = KafkaSourceOptions::from_config(&config.source)?;
    let table = StorageLocation::parse(&config.sink.table_path)?;
    let checkpoint = StorageLocation::parse(&config.checkpoint.location)?;

    let mut lines = vec![
        format!("Topic:            {}", options.topic()),
        format!(
            "Starting offsets: {}{}",
            starting_offsets_label(config.source.starting_offsets),
            if config.source.fail_on_data_loss {
                " (fail on data loss)"
            } else {
                ""
            }
        ),
        format!(
            "Table:            {} [{}]",
            table,
            credentials_label(&StorageCredentials::for_location(&config.storage, &table))
        ),
        format!(
            "Checkpoint:       {} [{}]",
            checkpoint,
            credentials_label(&StorageCredentials::for_location(
                &config.storage,
                &checkpoint
            ))
        ),
        format!(
            "Trigger:          {} records / {} MB / {} ms",
            config.trigger.max_records_per_batch,
            config.trigger.max_batch_size_mb,
            config.trigger.batch_timeout_ms
        ),
        String::from("Client properties:"),
    ];
    for (key, value) in options.redacted_properties() {
        lines.push(format!("  {} = {}", key, value));
    }
    Ok(lines)
}

fn credentials_label(credentials: &StorageCredentials) -> String {
    match credentials {
        StorageCredentials::AccountKey { account, .. } => format!("account key for {}", account),
        StorageCredentials::Sas { account, .. } => format!("SAS token for {}", account),
        StorageCredentials::AwsKeys { access_key_id, .. } => {
            format!("AWS access key {}", access_key_id)
        }
        StorageCredentials::Environment => String::from("environment"),
    }
}
