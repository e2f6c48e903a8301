//! Query orchestration.

mod query;

pub use query::{BatchReport, QueryStatus, StreamingQuery};
