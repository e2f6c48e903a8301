//! librdkafka client properties for the source.
//!
//! Properties are assembled in layers: generated defaults, the `[source.security]`
//! section, the Event Hubs shortcut, then user `client_options`, each layer
//! overriding the previous one.

use crate::config::{SourceConfig, StartingOffsets};
use crate::{Error, Result};
use rdkafka::ClientConfig;
use std::fmt;

/// SASL username the Event Hubs Kafka endpoint expects for connection string auth.
pub const EVENT_HUBS_SASL_USERNAME: &str = "$ConnectionString";

const REDACTED: &str = "<redacted>";

/// Parsed Azure Event Hubs connection string.
///
/// `Endpoint=sb://<ns>.servicebus.windows.net/;SharedAccessKeyName=<name>;SharedAccessKey=<key>[;EntityPath=<hub>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHubsConnection {
    /// Namespace host, e.g. `contoso.servicebus.windows.net`
    pub endpoint_host: String,
    /// Policy name
    pub shared_access_key_name: Option<String>,
    /// Event hub name, present on hub-scoped connection strings
    pub entity_path: Option<String>,
}

impl EventHubsConnection {
    /// Parse a connection string. Only `Endpoint` is required.
    pub fn parse(conn_str: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut entity_path = None;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            // Keys are base64 and may end in '='
            let Some((key, value)) = part.split_once('=') else {
                return Err(Error::Config(format!(
                    "malformed Event Hubs connection string segment '{}'",
                    part.split('=').next().unwrap_or_default()
                )));
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim().to_string()),
                "sharedaccesskeyname" => key_name = Some(value.trim().to_string()),
                "entitypath" => entity_path = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            Error::Config("Event Hubs connection string has no Endpoint".into())
        })?;
        let endpoint_host = endpoint
            .trim_start_matches("sb://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string();
        if endpoint_host.is_empty() {
            return Err(Error::Config(
                "Event Hubs connection string has an empty Endpoint".into(),
            ));
        }

        Ok(Self {
            endpoint_host,
            shared_access_key_name: key_name,
            entity_path: entity_path.filter(|p| !p.is_empty()),
        })
    }
}

/// Resolved source options: topic plus the ordered client property list.
#[derive(Clone)]
pub struct KafkaSourceOptions {
    topic: String,
    properties: Vec<(String, String)>,
}

impl KafkaSourceOptions {
    /// Build client properties from the source configuration.
    ///
    /// Secrets are resolved here, so this fails if an `env:` reference is unset.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let connection = match config.event_hubs {
            Some(ref eh) => Some((eh, eh.connection_string.expose()?)),
            None => None,
        };
        let parsed = match connection {
            Some((_, ref conn_str)) => Some(EventHubsConnection::parse(conn_str)?),
            None => None,
        };

        let topic = if !config.topic.is_empty() {
            config.topic.clone()
        } else {
            connection
                .as_ref()
                .and_then(|(eh, _)| eh.name.clone())
                .or_else(|| parsed.as_ref().and_then(|p| p.entity_path.clone()))
                .ok_or_else(|| {
                    Error::Config(
                        "Kafka topic is required (set source.topic, event_hubs.name, or EntityPath)"
                            .into(),
                    )
                })?
        };

        let mut options = Self {
            topic: topic.clone(),
            properties: Vec::new(),
        };

        if !config.bootstrap_servers.is_empty() {
            options.set("bootstrap.servers", config.bootstrap_servers.join(","));
        }
        options
            .set(
                "group.id",
                config
                    .consumer_group
                    .clone()
                    .unwrap_or_else(|| format!("k2d-{}", topic)),
            )
            // Progress lives in the checkpoint, never in the broker
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set(
                "auto.offset.reset",
                if config.fail_on_data_loss {
                    "error"
                } else {
                    "earliest"
                },
            )
            .set("session.timeout.ms", config.session_timeout_ms.to_string());

        let security = &config.security;
        if let Some(ref protocol) = security.protocol {
            options.set("security.protocol", protocol.clone());
        }
        if let Some(ref mechanism) = security.sasl_mechanism {
            options.set("sasl.mechanism", mechanism.clone());
        }
        if let Some(ref username) = security.sasl_username {
            options.set("sasl.username", username.clone());
        }
        if let Some(ref password) = security.sasl_password {
            options.set("sasl.password", password.expose()?);
        }
        if let Some(ref path) = security.ssl_ca_location {
            options.set("ssl.ca.location", path.to_string_lossy().into_owned());
        }

        if let (Some((eh, conn_str)), Some(parsed)) = (connection, parsed) {
            let namespace = eh
                .namespace
                .clone()
                .unwrap_or_else(|| parsed.endpoint_host.clone());
            let bootstrap = if namespace.contains(':') {
                namespace
            } else {
                format!("{}:{}", namespace, eh.port)
            };
            options
                .set("bootstrap.servers", bootstrap)
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", EVENT_HUBS_SASL_USERNAME)
                .set("sasl.password", conn_str);
        }

        for (key, value) in &config.client_options {
            let key = key.strip_prefix("kafka.").unwrap_or(key);
            if key == "sasl.jaas.config" {
                let (username, password) = parse_jaas_config(value)?;
                options
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            } else {
                options.set(key, value.clone());
            }
        }

        if options.get("bootstrap.servers").is_none() {
            return Err(Error::Config("bootstrap.servers could not be determined".into()));
        }

        Ok(options)
    }

    /// Set or replace a property, keeping first-insertion order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.properties.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.properties.push((key, value)),
        }
        self
    }

    /// Look up a property value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Topic to read.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Bootstrap servers as passed to the client.
    pub fn bootstrap_servers(&self) -> &str {
        self.get("bootstrap.servers").unwrap_or_default()
    }

    /// All properties in insertion order.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Properties with credentials masked, for logs and `validate` output.
    pub fn redacted_properties(&self) -> Vec<(String, String)> {
        self.properties
            .iter()
            .map(|(k, v)| {
                if is_sensitive(k) {
                    (k.clone(), REDACTED.to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    /// rdkafka client configuration with every property applied.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        for (key, value) in &self.properties {
            client_config.set(key, value);
        }
        client_config
    }
}

impl fmt::Debug for KafkaSourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSourceOptions")
            .field("topic", &self.topic)
            .field("properties", &self.redacted_properties())
            .finish()
    }
}

fn is_sensitive(key: &str) -> bool {
    key.contains("password") || key.contains("secret") || key.ends_with(".key")
}

/// Extract `username="..."` and `password="..."` from a JAAS login module line.
fn parse_jaas_config(jaas: &str) -> Result<(String, String)> {
    let username = jaas_value(jaas, "username");
    let password = jaas_value(jaas, "password");
    match (username, password) {
        (Some(u), Some(p)) => Ok((u, p)),
        _ => Err(Error::Config(
            "sasl.jaas.config must contain username=\"...\" and password=\"...\"".into(),
        )),
    }
}

fn jaas_value(jaas: &str, field: &str) -> Option<String> {
    let needle = format!("{}=\"", field);
    let start = jaas.find(&needle)? + needle.len();
    let len = jaas[start..].find('"')?;
    Some(jaas[start..start + len].to_string())
}

/// Map the starting-offset policy to a client-side reset value for logging.
pub fn starting_offsets_label(starting: StartingOffsets) -> &'static str {
    match starting {
        StartingOffsets::Earliest => "earliest",
        StartingOffsets::Latest => "latest",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventHubsConfig;
    use crate::secret::Secret;

    const CONN_STR: &str = "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=a2V5PQ==";

    fn event_hubs_source(name: Option<&str>, conn_str: &str) -> SourceConfig {
        SourceConfig {
            session_timeout_ms: 30000,
            event_hubs: Some(EventHubsConfig {
                namespace: None,
                name: name.map(String::from),
                connection_string: Secret::new(conn_str),
                port: 9093,
            }),
            ..SourceConfig::default()
        }
    }

    #[test]
    fn test_parse_connection_string() {
        let conn = EventHubsConnection::parse(&format!("{};EntityPath=patient-flow", CONN_STR))
            .unwrap();
        assert_eq!(conn.endpoint_host, "contoso.servicebus.windows.net");
        assert_eq!(conn.shared_access_key_name.as_deref(), Some("listen"));
        assert_eq!(conn.entity_path.as_deref(), Some("patient-flow"));
    }

    #[test]
    fn test_parse_connection_string_without_endpoint() {
        let err = EventHubsConnection::parse("SharedAccessKeyName=a;SharedAccessKey=b").unwrap_err();
        assert!(err.to_string().contains("Endpoint"));
    }

    #[test]
    fn test_event_hubs_properties_pass_literals_unmodified() {
        let options =
            KafkaSourceOptions::from_config(&event_hubs_source(Some("patient-flow"), CONN_STR))
                .unwrap();

        assert_eq!(options.topic(), "patient-flow");
        assert_eq!(
            options.bootstrap_servers(),
            "contoso.servicebus.windows.net:9093"
        );
        assert_eq!(options.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(options.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(options.get("sasl.username"), Some("$ConnectionString"));
        assert_eq!(options.get("sasl.password"), Some(CONN_STR));
        assert_eq!(options.get("enable.auto.commit"), Some("false"));
        assert_eq!(options.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(options.get("group.id"), Some("k2d-patient-flow"));
    }

    #[test]
    fn test_topic_from_entity_path() {
        let conn_str = format!("{};EntityPath=admissions", CONN_STR);
        let options = KafkaSourceOptions::from_config(&event_hubs_source(None, &conn_str)).unwrap();
        assert_eq!(options.topic(), "admissions");
    }

    #[test]
    fn test_missing_topic_is_config_error() {
        let err = KafkaSourceOptions::from_config(&event_hubs_source(None, CONN_STR)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_fail_on_data_loss_sets_reset_error() {
        let mut source = event_hubs_source(Some("patient-flow"), CONN_STR);
        source.fail_on_data_loss = true;
        let options = KafkaSourceOptions::from_config(&source).unwrap();
        assert_eq!(options.get("auto.offset.reset"), Some("error"));
    }

    #[test]
    fn test_client_options_override_generated() {
        let mut source = SourceConfig {
            bootstrap_servers: vec!["localhost:9092".into()],
            topic: "events".into(),
            ..SourceConfig::default()
        };
        source
            .client_options
            .insert("kafka.group.id".into(), "bronze-readers".into());
        source
            .client_options
            .insert("fetch.max.bytes".into(), "1048576".into());
        source.client_options.insert(
            "kafka.sasl.jaas.config".into(),
            r#"org.apache.kafka.common.security.plain.PlainLoginModule required username="$ConnectionString" password="Endpoint=sb://x/;SharedAccessKey=k=";"#.into(),
        );

        let options = KafkaSourceOptions::from_config(&source).unwrap();
        assert_eq!(options.get("group.id"), Some("bronze-readers"));
        assert_eq!(options.get("fetch.max.bytes"), Some("1048576"));
        assert_eq!(options.get("sasl.username"), Some("$ConnectionString"));
        assert_eq!(
            options.get("sasl.password"),
            Some("Endpoint=sb://x/;SharedAccessKey=k=")
        );
        assert!(options.get("sasl.jaas.config").is_none());
    }

    #[test]
    fn test_malformed_jaas_config() {
        let mut source = SourceConfig {
            bootstrap_servers: vec!["localhost:9092".into()],
            topic: "events".into(),
            ..SourceConfig::default()
        };
        source
            .client_options
            .insert("sasl.jaas.config".into(), "PlainLoginModule required;".into());
        assert!(KafkaSourceOptions::from_config(&source).is_err());
    }

    #[test]
    fn test_redacted_properties() {
        let options =
            KafkaSourceOptions::from_config(&event_hubs_source(Some("patient-flow"), CONN_STR))
                .unwrap();
        let redacted = options.redacted_properties();
        let password = redacted
            .iter()
            .find(|(k, _)| k == "sasl.password")
            .map(|(_, v)| v.as_str());
        assert_eq!(password, Some("<redacted>"));
        assert!(!format!("{:?}", options).contains("SharedAccessKey"));
    }
}
