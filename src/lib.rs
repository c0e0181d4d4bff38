//! exegete - interpretable autoprompting against hosted causal LMs.
//!
//! Given a dataset of `(input, output)` string pairs, exegete searches
//! for a short natural-language prompt that explains how each output
//! follows from its input, ranked by how well a pretrained causal LM
//! predicts the outputs when the prompt is prepended.
//!
//! ## Architecture
//!
//! - **Proposer**: samples and mutates candidate prompts through the
//!   completions endpoint
//! - **Scorer**: reranks candidates by the mean per-token log-likelihood
//!   of the outputs under `echo=true` logprobs
//! - **SearchEngine**: the iterative propose / score / select loop, with
//!   checkpointing and cost accounting
//! - **SuffixSearcher**: the alternative strategy, BFS beam decoding of
//!   a shared suffix over averaged next-token distributions
//!
//! The model is reached exclusively over an OpenAI-compatible text
//! completions API (OpenRouter by default; vLLM / TGI / llama.cpp for
//! on-prem), so there is no gradient access anywhere.

pub mod api;
pub mod checkpoint;
pub mod client;
pub mod eval;
pub mod models;
pub mod scoring;
pub mod search;

// Re-exports for convenience
pub use api::explain_dataset;
pub use checkpoint::{CheckpointManager, SearchCheckpoint};
pub use client::{CompletionsClient, RateLimiter};
pub use models::{
    Config, Dataset, Example, ExegeteError, Explanation, PromptCheck, Result, ScoredPrompt,
};
pub use scoring::Scorer;
pub use search::{Proposer, SearchEngine, SuffixSearcher};
