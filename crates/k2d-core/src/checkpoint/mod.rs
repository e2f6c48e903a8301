//! Streaming checkpoint: query id, write-ahead offsets and commit markers.
//!
//! Together with the Delta `txn` action this makes restarts exactly-once:
//! a batch is either found in the table and skipped, or replanned from the
//! same offsets under the same batch id.

mod entries;
mod recovery;
mod store;

pub use entries::{CheckpointMetadata, CommitEntry, InitialOffsets, OffsetsEntry};
pub use recovery::{CheckpointState, RecoveredState, RecoveryDecision};
pub use store::CheckpointStore;
