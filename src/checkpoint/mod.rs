//! Checkpointing for resumable search runs.
//!
//! Provides:
//! - `SearchCheckpoint`: serializable between-step state of a run
//! - `CheckpointManager`: atomic persistence with backup recovery

mod state;

pub use state::*;
