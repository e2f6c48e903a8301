//! Ingest command implementation.

use crate::server::{start_server, ServerState};
use anyhow::Result;
use k2d_core::health::HealthCheck;
use k2d_core::kafka::{starting_offsets_label, KafkaSource, KafkaSourceOptions};
use k2d_core::metrics::IngestionMetrics;
use k2d_core::{Config, StreamingQuery};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Command line overrides applied on top of the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub bootstrap_servers: Option<String>,
    pub topic: Option<String>,
    pub table_path: Option<String>,
    pub checkpoint_location: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(servers) = self.bootstrap_servers {
            config.source.bootstrap_servers = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(topic) = self.topic {
            config.source.topic = topic;
        }
        if let Some(path) = self.table_path {
            config.sink.table_path = path;
        }
        if let Some(location) = self.checkpoint_location {
            config.checkpoint.location = location;
        }
    }
}

/// Run the streaming query until a signal arrives. Returns true when it
/// stopped because of a signal.
pub async fn run(mut config: Config, overrides: Overrides) -> Result<bool> {
    overrides.apply(&mut config);
    config.validate()?;

    let options = KafkaSourceOptions::from_config(&config.source)?;
    info!(
        topic = %options.topic(),
        bootstrap_servers = %options.bootstrap_servers(),
        starting_offsets = starting_offsets_label(config.source.starting_offsets),
        fail_on_data_loss = config.source.fail_on_data_loss,
        table_path = %config.sink.table_path,
        checkpoint = %config.checkpoint.location,
        "Starting streaming query"
    );
    debug!(properties = ?options.redacted_properties(), "Client properties");

    let source = KafkaSource::new(
        &options,
        Duration::from_millis(config.source.metadata_timeout_ms),
    )?;

    let health_port = config.monitoring.health_port;
    let metrics_port = config.monitoring.metrics_port;

    let health = Arc::new(HealthCheck::for_query());
    let metrics = Arc::new(IngestionMetrics::new());

    let mut query = StreamingQuery::new(config, source)?
        .with_observability(Arc::clone(&health), Arc::clone(&metrics));
    let shutdown_tx = query.shutdown_signal();

    let server_state = Arc::new(ServerState { health, metrics });
    tokio::spawn(start_server(
        server_state,
        health_port,
        metrics_port,
        shutdown_tx.subscribe(),
    ));

    // SIGINT and SIGTERM both stop the query after the in-flight batch
    let interrupted = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&interrupted);
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, initiating graceful shutdown");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        signal_flag.store(true, Ordering::SeqCst);
        let _ = shutdown_signal.send(());
    });

    let result = query.run().await;
    // Stop the HTTP servers whatever the outcome
    let _ = shutdown_tx.send(());
    result?;

    info!(status = ?query.status(), "Streaming query stopped");
    Ok(interrupted.load(Ordering::SeqCst))
}
