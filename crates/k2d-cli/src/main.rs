//! K2D CLI - Kafka / Event Hubs to Delta bronze ingestion tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use k2d_core::config::LogFormat;
use k2d_core::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Source error (connection, metadata, poll, data loss)
    KafkaError = 2,
    /// Delta table error (log, schema, protocol, commit)
    TableError = 3,
    /// Storage error (Azure, S3, filesystem)
    StorageError = 4,
    /// Checkpoint error
    CheckpointError = 5,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by the first library error in its chain.
    fn from_error(error: &anyhow::Error) -> Self {
        let Some(core_error) = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<k2d_core::Error>())
        else {
            return ExitCode::RuntimeError;
        };

        match core_error.kind() {
            "config" => ExitCode::ConfigError,
            "kafka" => ExitCode::KafkaError,
            "delta" => ExitCode::TableError,
            "storage" => ExitCode::StorageError,
            "checkpoint" => ExitCode::CheckpointError,
            "shutdown" => ExitCode::SignalInterrupt,
            _ => ExitCode::RuntimeError,
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "k2d")]
#[command(about = "Kafka / Event Hubs to Delta bronze ingestion CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming query until interrupted
    Ingest {
        /// Override bootstrap servers (comma separated)
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override topic
        #[arg(long)]
        topic: Option<String>,

        /// Override Delta table path
        #[arg(long)]
        table_path: Option<String>,

        /// Override checkpoint location
        #[arg(long)]
        checkpoint_location: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show status and health of a running ingest
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL (defaults to the health URL on the metrics port)
        #[arg(long)]
        metrics_url: Option<String>,
    },

    /// Print the query id, last batch and offsets from the checkpoint
    Checkpoint {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log settings come from the config file when it parses; JSON otherwise
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);
    let log_format = monitoring
        .as_ref()
        .map(|m| m.log_format)
        .unwrap_or(LogFormat::Json);
    let default_level = monitoring
        .as_ref()
        .map(|m| m.log_level.as_filter())
        .unwrap_or("info");

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(default_level),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Ingest {
            bootstrap_servers,
            topic,
            table_path,
            checkpoint_location,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let overrides = commands::ingest::Overrides {
                bootstrap_servers,
                topic,
                table_path,
                checkpoint_location,
            };
            let interrupted = commands::ingest::run(config, overrides).await?;
            if interrupted {
                return Ok(ExitCode::SignalInterrupt);
            }
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            commands::validate::run(&config)?;
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, metrics_url.as_deref()).await?;
        }

        Commands::Checkpoint { json } => {
            let config = load_config(cli.config.as_deref())?;
            commands::checkpoint::run(&config, json).await?;
        }
    }

    Ok(ExitCode::Success)
}

/// Read the config file without validating it; CLI overrides apply first.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or_else(|| Path::new("config.toml"));

    let content = std::fs::read_to_string(path).map_err(|e| {
        k2d_core::Error::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    let config: Config = toml::from_str(&content).map_err(k2d_core::Error::from)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2d_core::{CheckpointError, DeltaError, KafkaError};

    #[test]
    fn test_exit_code_from_core_error() {
        let cases = [
            (k2d_core::Error::Config("bad".into()), ExitCode::ConfigError),
            (
                k2d_core::Error::Kafka(KafkaError::ConsumerClosed),
                ExitCode::KafkaError,
            ),
            (
                k2d_core::Error::Delta(DeltaError::EmptyBatch),
                ExitCode::TableError,
            ),
            (k2d_core::Error::Storage("denied".into()), ExitCode::StorageError),
            (
                k2d_core::Error::Checkpoint(CheckpointError::ReadFailed("x".into())),
                ExitCode::CheckpointError,
            ),
            (k2d_core::Error::Shutdown, ExitCode::SignalInterrupt),
            (
                k2d_core::Error::FlushTimeout {
                    buffered: 5,
                    timeout: std::time::Duration::from_secs(30),
                },
                ExitCode::RuntimeError,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(ExitCode::from_error(&anyhow::Error::new(error)), expected);
        }
    }

    #[test]
    fn test_exit_code_through_context() {
        let error = anyhow::Error::new(k2d_core::Error::Kafka(KafkaError::Timeout("t".into())))
            .context("starting query");
        assert_eq!(ExitCode::from_error(&error), ExitCode::KafkaError);

        let other = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&other), ExitCode::RuntimeError);
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/k2d.toml"))).unwrap_err();
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);
    }

    #[test]
    fn test_cli_parses_ingest_overrides() {
        let cli = Cli::try_parse_from([
            "k2d",
            "--config",
            "k2d.toml",
            "ingest",
            "--topic",
            "patient-flow",
            "--checkpoint-location",
            "/mnt/ckpt",
        ])
        .unwrap();
        match cli.command {
            Commands::Ingest {
                topic,
                checkpoint_location,
                table_path,
                ..
            } => {
                assert_eq!(topic.as_deref(), Some("patient-flow"));
                assert_eq!(checkpoint_location.as_deref(), Some("/mnt/ckpt"));
                assert!(table_path.is_none());
            }
            _ => panic!("expected ingest"),
        }
    }
}
