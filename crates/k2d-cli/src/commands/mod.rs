//! Subcommand implementations.

pub mod checkpoint;
pub mod ingest;
pub mod status;
pub mod validate;
