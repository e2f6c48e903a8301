//! Delta transaction log actions.
//!
//! Each commit file holds one JSON object per line, keyed by action type.
//! Only the actions this writer needs are decoded; any other line (`cdc`,
//! `domainMetadata`, `commitInfo` from other engines) is skipped.

use crate::projection::RAW_JSON_COLUMN;
use crate::{DeltaError, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Highest reader version this writer understands.
pub const MAX_READER_VERSION: i32 = 1;
/// Highest writer version this writer honours.
pub const MAX_WRITER_VERSION: i32 = 2;

/// Table protocol requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub min_reader_version: i32,
    pub min_writer_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_features: Option<Vec<String>>,
}

impl Protocol {
    /// Protocol of tables created by this writer.
    pub fn new_table() -> Self {
        Self {
            min_reader_version: 1,
            min_writer_version: 2,
            reader_features: None,
            writer_features: None,
        }
    }

    /// Fail if appending would need table features this writer lacks.
    pub fn ensure_supported(&self) -> Result<()> {
        if self.min_reader_version > MAX_READER_VERSION
            || self.min_writer_version > MAX_WRITER_VERSION
        {
            return Err(Error::Delta(DeltaError::UnsupportedProtocol {
                min_reader_version: self.min_reader_version,
                min_writer_version: self.min_writer_version,
            }));
        }
        Ok(())
    }
}

/// Storage format of data files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub provider: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Table metadata: id, schema, partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub format: Format,
    pub schema_string: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
}

impl Metadata {
    /// Metadata for a new `raw_json` table.
    pub fn raw_json_table(created_time: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            description: None,
            format: Format::default(),
            schema_string: raw_json_schema_string(),
            partition_columns: Vec::new(),
            configuration: HashMap::new(),
            created_time: Some(created_time),
        }
    }

    /// Fail unless the table is unpartitioned with exactly the `raw_json string` column.
    pub fn ensure_raw_json_schema(&self) -> Result<()> {
        let mismatch = |actual: String| {
            Error::Delta(DeltaError::SchemaMismatch {
                expected: format!("{} string", RAW_JSON_COLUMN),
                actual,
            })
        };

        let schema: Value = serde_json::from_str(&self.schema_string)
            .map_err(|e| mismatch(format!("unparseable schema: {}", e)))?;
        let fields = schema
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| mismatch(self.schema_string.clone()))?;

        let columns: Vec<String> = fields
            .iter()
            .map(|f| {
                format!(
                    "{} {}",
                    f.get("name").and_then(Value::as_str).unwrap_or("?"),
                    f.get("type").map(|t| t.to_string().replace('"', "")).unwrap_or_default()
                )
            })
            .collect();

        if columns != [format!("{} string", RAW_JSON_COLUMN)] {
            return Err(mismatch(columns.join(", ")));
        }
        if !self.partition_columns.is_empty() {
            return Err(mismatch(format!(
                "partitioned by {}",
                self.partition_columns.join(", ")
            )));
        }
        Ok(())
    }
}

/// Delta schema JSON of the single nullable `raw_json` string column.
pub fn raw_json_schema_string() -> String {
    format!(
        r#"{{"type":"struct","fields":[{{"name":"{}","type":"string","nullable":true,"metadata":{{}}}}]}}"#,
        RAW_JSON_COLUMN
    )
}

/// A data file added to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    pub path: String,
    #[serde(default)]
    pub partition_values: HashMap<String, Option<String>>,
    pub size: i64,
    pub modification_time: i64,
    pub data_change: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

impl Add {
    /// `numRecords` from the file statistics, when present.
    pub fn num_records(&self) -> Option<i64> {
        let stats: Value = serde_json::from_str(self.stats.as_deref()?).ok()?;
        stats.get("numRecords")?.as_i64()
    }
}

/// File statistics string for a `raw_json` data file.
pub fn raw_json_stats(num_records: usize, null_count: usize) -> String {
    json!({
        "numRecords": num_records,
        "nullCount": { RAW_JSON_COLUMN: null_count }
    })
    .to_string()
}

/// A data file logically removed from the table. Read only; never written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    #[serde(default)]
    pub data_change: bool,
}

/// Application transaction marker used for idempotent streaming writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Txn {
    pub app_id: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

/// Provenance of a commit. Written only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub timestamp: i64,
    pub operation: String,
    pub operation_parameters: HashMap<String, String>,
    pub is_blind_append: bool,
    pub engine_info: String,
    pub txn_id: String,
}

impl CommitInfo {
    /// commitInfo of a streaming append.
    pub fn streaming_append(timestamp: i64, query_id: &str, epoch_id: i64) -> Self {
        let operation_parameters = HashMap::from([
            ("outputMode".to_string(), "Append".to_string()),
            ("queryId".to_string(), query_id.to_string()),
            ("epochId".to_string(), epoch_id.to_string()),
        ]);
        Self {
            timestamp,
            operation: "STREAMING UPDATE".to_string(),
            operation_parameters,
            is_blind_append: true,
            engine_info: concat!("k2d/", env!("CARGO_PKG_VERSION")).to_string(),
            txn_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// One line of a commit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Protocol(Protocol),
    Metadata(Metadata),
    Add(Add),
    Remove(Remove),
    Txn(Txn),
    CommitInfo(CommitInfo),
}

impl Action {
    /// Serialize to a single log line (without the trailing newline).
    pub fn to_json_line(&self) -> Result<String> {
        let value = match self {
            Action::Protocol(p) => json!({ "protocol": p }),
            Action::Metadata(m) => json!({ "metaData": m }),
            Action::Add(a) => json!({ "add": a }),
            Action::Remove(r) => json!({ "remove": r }),
            Action::Txn(t) => json!({ "txn": t }),
            Action::CommitInfo(c) => json!({ "commitInfo": c }),
        };
        Ok(serde_json::to_string(&value)?)
    }

    /// Decode a log line. Returns `None` for action types this writer ignores.
    pub fn from_json_line(line: &str) -> Result<Option<Self>> {
        let mut value: Value = serde_json::from_str(line)?;
        let Some(object) = value.as_object_mut() else {
            return Err(Error::Serialization(
                "log line is not a JSON object".to_string(),
            ));
        };

        let action = if let Some(v) = object.remove("protocol") {
            Action::Protocol(serde_json::from_value(v)?)
        } else if let Some(v) = object.remove("metaData") {
            Action::Metadata(serde_json::from_value(v)?)
        } else if let Some(v) = object.remove("add") {
            Action::Add(serde_json::from_value(v)?)
        } else if let Some(v) = object.remove("remove") {
            Action::Remove(serde_json::from_value(v)?)
        } else if let Some(v) = object.remove("txn") {
            Action::Txn(serde_json::from_value(v)?)
        } else {
            return Ok(None);
        };
        Ok(Some(action))
    }
}
