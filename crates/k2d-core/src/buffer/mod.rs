//! Micro-batch buffer with Arrow column builders.
//!
//! Records are projected as they arrive; a closed batch carries its rows and
//! the per-partition offsets it covers.

mod micro_batch;

pub use micro_batch::{MicroBatch, MicroBatchBuffer};
