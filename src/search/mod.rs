//! Prompt search strategies.
//!
//! Provides:
//! - `SearchEngine`: the iterative propose / score / select loop
//! - `Proposer`: candidate generation and mutation
//! - `PromptPool`: running-score pool with top-k queries
//! - `SuffixSearcher`: BFS beam decoding of a shared suffix

mod engine;
mod pool;
mod proposer;
mod suffix;

pub use engine::*;
pub use pool::*;
pub use proposer::*;
pub use suffix::*;
