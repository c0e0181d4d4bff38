//! HTTP client module.

mod completions;
mod rate_limiter;

pub use completions::*;
pub use rate_limiter::*;
