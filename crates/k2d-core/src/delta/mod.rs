//! Append-only Delta table sink.
//!
//! Writes Parquet data files and JSON log commits directly on an
//! `ObjectStore`. Streaming appends are idempotent per query through the
//! `txn` action.

mod actions;
mod log;
mod table;
mod writer;

pub use actions::{
    raw_json_schema_string, Action, Add, CommitInfo, Metadata, Protocol, Remove, Txn,
};
pub use log::{commit_path, DeltaLog, TableSnapshot, DELTA_LOG_DIR};
pub use table::DeltaTable;
pub use writer::{AppendOutcome, CommitStats, DeltaWriter};
