//! Configuration structures for k2d.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//!
//! ```toml
//! [source]
//! starting_offsets = "latest"
//! fail_on_data_loss = false
//!
//! [source.event_hubs]
//! namespace = "my-namespace.servicebus.windows.net"
//! name = "patient-flow"
//! connection_string = "env:EVENT_HUB_CONNECTION_STRING"
//!
//! [sink]
//! table_path = "abfss://bronze@account.dfs.core.windows.net/patient_flow"
//!
//! [checkpoint]
//! location = "/mnt/bronze/_checkpoints/patient_flow"
//!
//! [storage.account_keys]
//! account = "env:STORAGE_ACCOUNT_KEY"
//! ```

use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Kafka / Event Hubs source configuration
    pub source: SourceConfig,

    /// Delta sink configuration
    pub sink: SinkConfig,

    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,

    /// Storage credentials
    #[serde(default)]
    pub storage: StorageConfig,

    /// Micro-batch trigger configuration
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka source configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Kafka bootstrap servers (derived from `event_hubs` when empty)
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from (derived from `event_hubs` when empty)
    #[serde(default)]
    pub topic: String,

    /// Consumer group ID reported to the broker
    #[serde(default)]
    pub consumer_group: Option<String>,

    /// Where to start when no checkpoint exists
    #[serde(default)]
    pub starting_offsets: StartingOffsets,

    /// Fail the query when checkpointed offsets are no longer available
    #[serde(default)]
    pub fail_on_data_loss: bool,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Timeout for metadata and watermark requests in milliseconds
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    /// How often to look for newly added partitions
    #[serde(default = "default_partition_discovery_interval_seconds")]
    pub partition_discovery_interval_seconds: u64,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,

    /// Azure Event Hubs shortcut
    #[serde(default)]
    pub event_hubs: Option<EventHubsConfig>,

    /// Extra librdkafka properties, passed through unmodified.
    /// A leading `kafka.` is stripped from keys.
    #[serde(default)]
    pub client_options: BTreeMap<String, String>,
}

/// Where a fresh query starts reading.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartingOffsets {
    /// Start from earliest offset
    Earliest,
    /// Start from latest offset (only new records)
    #[default]
    Latest,
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<Secret>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,
}

/// Azure Event Hubs Kafka endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventHubsConfig {
    /// Namespace host, e.g. `my-ns.servicebus.windows.net`.
    /// Taken from the connection string endpoint when omitted.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Event hub name (the Kafka topic).
    /// Taken from the connection string `EntityPath` when omitted.
    #[serde(default)]
    pub name: Option<String>,

    /// Namespace or event hub connection string
    pub connection_string: Secret,

    /// Kafka endpoint port
    #[serde(default = "default_event_hubs_port")]
    pub port: u16,
}

/// Delta sink configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// Table location (abfss://, az://, s3://, file:// or a local path)
    pub table_path: String,

    /// Parquet compression
    #[serde(default)]
    pub compression: ParquetCompression,

    /// Maximum rows per Parquet row group
    #[serde(default = "default_max_row_group_size")]
    pub max_row_group_size: usize,

    /// Attempts before a conflicting log commit is abandoned
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (default, same as Spark)
    #[default]
    Snappy,
    /// Zstd compression (better ratio)
    Zstd,
    /// LZ4 compression (faster)
    Lz4,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

impl ParquetCompression {
    /// Codec infix used in data file names (`part-...-c000.snappy.parquet`).
    pub fn file_suffix(&self) -> &'static str {
        match self {
            ParquetCompression::Snappy => ".snappy.parquet",
            ParquetCompression::Zstd => ".zstd.parquet",
            ParquetCompression::Lz4 => ".lz4.parquet",
            ParquetCompression::Gzip => ".gz.parquet",
            ParquetCompression::None => ".parquet",
        }
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    /// Checkpoint location, separate from the table location
    pub location: String,

    /// Number of batch entries kept in the checkpoint log
    #[serde(default = "default_min_batches_to_retain")]
    pub min_batches_to_retain: usize,
}

/// Storage credentials, scoped to the store they are handed to.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Azure storage account keys, by account name
    #[serde(default)]
    pub account_keys: BTreeMap<String, Secret>,

    /// Azure SAS tokens, by account name (used when no account key is set)
    #[serde(default)]
    pub sas_tokens: BTreeMap<String, Secret>,

    /// AWS region (for S3)
    pub aws_region: Option<String>,

    /// AWS access key ID
    pub aws_access_key_id: Option<String>,

    /// AWS secret access key
    pub aws_secret_access_key: Option<Secret>,

    /// S3 endpoint (for MinIO or other S3-compatible storage)
    pub s3_endpoint: Option<String>,
}

/// Micro-batch trigger configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerConfig {
    /// Maximum records per micro-batch
    #[serde(default = "default_max_records_per_batch")]
    pub max_records_per_batch: usize,

    /// Maximum buffered payload size per micro-batch in MB
    #[serde(default = "default_max_batch_size_mb")]
    pub max_batch_size_mb: usize,

    /// Longest time a micro-batch stays open, in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_records_per_batch: default_max_records_per_batch(),
            max_batch_size_mb: default_max_batch_size_mb(),
            batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Metrics HTTP port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health check HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Filter directive for tracing-subscriber.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_metadata_timeout_ms() -> u64 {
    10000
}
fn default_partition_discovery_interval_seconds() -> u64 {
    300
}
fn default_event_hubs_port() -> u16 {
    9093
}
fn default_max_row_group_size() -> usize {
    128 * 1024
}
fn default_max_commit_retries() -> u32 {
    10
}
fn default_min_batches_to_retain() -> usize {
    100
}
fn default_max_records_per_batch() -> usize {
    10000
}
fn default_max_batch_size_mb() -> usize {
    64
}
fn default_batch_timeout_ms() -> u64 {
    5000
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_health_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.source.bootstrap_servers.is_empty() && self.source.event_hubs.is_none() {
            return Err(crate::Error::Config(
                "At least one bootstrap server or an event_hubs section is required".into(),
            ));
        }

        // With Event Hubs the topic may come from the connection string's
        // EntityPath, which is only known once the secret is resolved.
        if self.source.topic.is_empty() && self.source.event_hubs.is_none() {
            return Err(crate::Error::Config("Kafka topic is required".into()));
        }

        if let Some(ref eh) = self.source.event_hubs {
            if !self.source.bootstrap_servers.is_empty() {
                return Err(crate::Error::Config(
                    "bootstrap_servers cannot be combined with [source.event_hubs]; \
                     the Event Hubs namespace is the bootstrap server"
                        .into(),
                ));
            }
            if eh.connection_string.is_empty() {
                return Err(crate::Error::Config(
                    "Event Hubs connection string is required".into(),
                ));
            }
        }

        if self.sink.table_path.trim().is_empty() {
            return Err(crate::Error::Config("Table path is required".into()));
        }

        if self.checkpoint.location.trim().is_empty() {
            return Err(crate::Error::Config(
                "Checkpoint location is required".into(),
            ));
        }

        if normalize_location(&self.sink.table_path)
            == normalize_location(&self.checkpoint.location)
        {
            return Err(crate::Error::Config(
                "Checkpoint location must differ from the table path".into(),
            ));
        }

        if self.trigger.max_records_per_batch == 0 {
            return Err(crate::Error::Config(
                "trigger.max_records_per_batch must be greater than zero".into(),
            ));
        }

        if self.checkpoint.min_batches_to_retain == 0 {
            return Err(crate::Error::Config(
                "checkpoint.min_batches_to_retain must be greater than zero".into(),
            ));
        }

        if self.sink.max_row_group_size == 0 {
            return Err(crate::Error::Config(
                "sink.max_row_group_size must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

fn normalize_location(location: &str) -> String {
    location.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_HUBS_CONFIG: &str = r#"
        [source]
        fail_on_data_loss = false

        [source.event_hubs]
        namespace = "contoso.servicebus.windows.net"
        name = "patient-flow"
        connection_string = "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=abc="

        [sink]
        table_path = "abfss://bronze@contoso.dfs.core.windows.net/patient_flow"

        [checkpoint]
        location = "/mnt/bronze/_checkpoints/patient_flow"

        [storage.account_keys]
        contoso = "env:CONTOSO_STORAGE_KEY"
    "#;

    fn kafka_config() -> Config {
        Config {
            source: SourceConfig {
                bootstrap_servers: vec!["localhost:9092".into()],
                topic: "events".into(),
                session_timeout_ms: default_session_timeout_ms(),
                metadata_timeout_ms: default_metadata_timeout_ms(),
                partition_discovery_interval_seconds: default_partition_discovery_interval_seconds(),
                ..SourceConfig::default()
            },
            sink: SinkConfig {
                table_path: "/tmp/bronze/events".into(),
                compression: ParquetCompression::Snappy,
                max_row_group_size: default_max_row_group_size(),
                max_commit_retries: default_max_commit_retries(),
            },
            checkpoint: CheckpointConfig {
                location: "/tmp/bronze/_checkpoints/events".into(),
                min_batches_to_retain: default_min_batches_to_retain(),
            },
            storage: StorageConfig::default(),
            trigger: TriggerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    #[test]
    fn test_parse_event_hubs_config() {
        let config = Config::from_toml_str(EVENT_HUBS_CONFIG).unwrap();
        let eh = config.source.event_hubs.as_ref().unwrap();

        assert_eq!(eh.name.as_deref(), Some("patient-flow"));
        assert_eq!(eh.port, 9093);
        assert_eq!(config.source.starting_offsets, StartingOffsets::Latest);
        assert!(!config.source.fail_on_data_loss);
        assert_eq!(
            config.storage.account_keys["contoso"].env_var(),
            Some("CONTOSO_STORAGE_KEY")
        );
        assert_eq!(config.checkpoint.min_batches_to_retain, 100);
    }

    #[test]
    fn test_config_validation() {
        assert!(kafka_config().validate().is_ok());
    }

    #[test]
    fn test_event_hubs_rejects_bootstrap_servers() {
        let mut config = Config::from_toml_str(EVENT_HUBS_CONFIG).unwrap();
        assert!(config.validate().is_ok());

        config.source.bootstrap_servers = vec!["broker:9092".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bootstrap_servers cannot be combined"));
    }

    #[test]
    fn test_config_validation_empty_servers() {
        let mut config = kafka_config();
        config.source.bootstrap_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_topic() {
        let mut config = kafka_config();
        config.source.topic = "".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn test_config_validation_empty_table_path() {
        let mut config = kafka_config();
        config.sink.table_path = " ".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Table path"));
    }

    #[test]
    fn test_config_validation_shared_checkpoint_location() {
        let mut config = kafka_config();
        config.checkpoint.location = "/tmp/bronze/events/".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Checkpoint location"));
    }

    #[test]
    fn test_config_validation_zero_batch() {
        let mut config = kafka_config();
        config.trigger.max_records_per_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_trigger_config() {
        let config = TriggerConfig::default();
        assert_eq!(config.max_records_per_batch, 10000);
        assert_eq!(config.max_batch_size_mb, 64);
        assert_eq!(config.batch_timeout_ms, 5000);
    }

    #[test]
    fn test_default_monitoring_config() {
        let config = MonitoringConfig::default();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level.as_filter(), "info");
    }

    #[test]
    fn test_starting_offsets_default_is_latest() {
        assert_eq!(StartingOffsets::default(), StartingOffsets::Latest);
        assert_ne!(StartingOffsets::Earliest, StartingOffsets::Latest);
    }

    #[test]
    fn test_parquet_compression_suffix() {
        assert_eq!(ParquetCompression::default(), ParquetCompression::Snappy);
        assert_eq!(ParquetCompression::Snappy.file_suffix(), ".snappy.parquet");
        assert_eq!(ParquetCompression::None.file_suffix(), ".parquet");
    }

    #[test]
    fn test_client_options_roundtrip_from_toml() {
        let toml = r#"
            [source]
            bootstrap_servers = ["broker:9092"]
            topic = "events"

            [source.client_options]
            "kafka.fetch.max.bytes" = "1048576"
            "client.id" = "bronze"

            [sink]
            table_path = "./table"

            [checkpoint]
            location = "./checkpoint"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.source.client_options.len(), 2);
        assert_eq!(config.source.client_options["client.id"], "bronze");
    }
}
