//! Evaluation of fixed prompts and aggregation of prior runs.
//!
//! Provides:
//! - `EvalHarness`: score and probe fixed prompts against a dataset
//! - `collect_runs`: fold prior run results into one report

mod harness;
mod report;

pub use harness::*;
pub use report::*;
