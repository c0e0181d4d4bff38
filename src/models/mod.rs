//! Core data models for exegete: configuration, errors, datasets, and
//! candidate prompts.

mod candidate;
mod config;
mod dataset;
mod error;

pub use candidate::*;
pub use config::*;
pub use dataset::*;
pub use error::*;
