//! Candidate reranking against the frozen scorer model.

mod scorer;

pub use scorer::*;
