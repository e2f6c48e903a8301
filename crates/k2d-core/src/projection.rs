//! Payload projection: record value bytes to the `raw_json` text column.
//!
//! The payload is not parsed or validated. Invalid UTF-8 sequences become
//! U+FFFD so that every record still yields exactly one row.

use crate::source::KafkaRecord;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use std::sync::{Arc, OnceLock};

/// Name of the single output column.
pub const RAW_JSON_COLUMN: &str = "raw_json";

/// One output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedRecord {
    /// Payload as text, `None` for a null payload
    pub raw_json: Option<String>,
}

/// Cast the record payload to text.
pub fn project(record: &KafkaRecord) -> ProjectedRecord {
    ProjectedRecord {
        raw_json: record
            .value
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Arrow schema of the output table: `raw_json: Utf8 (nullable)`.
pub fn raw_json_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![Field::new(
                RAW_JSON_COLUMN,
                DataType::Utf8,
                true,
            )]))
        })
        .clone()
}
