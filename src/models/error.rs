//! Error types for exegete.

use thiserror::Error;

/// Top-level error type for exegete.
#[derive(Debug, Error)]
pub enum ExegeteError {
    // Expected failures: bad input, bad config, empty results.
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("No candidate prompts survived the search")]
    NoCandidates,

    #[error("Parse error: {0}")]
    ParseError(String),

    // Infrastructure failures: network, remote API, timeouts.
    #[error("Completions API error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Bugs. These indicate a broken invariant, not a recoverable state.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Errors from an OpenAI-compatible completions endpoint.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("API error (status {status}): {message}")]
    Status {
        status: u16,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Echo logprobs missing from response; endpoint may not support echo=true")]
    EchoUnsupported,

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        attempts: u32,
        last_error: String,
    },
}

impl ExegeteError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::Network(_)
            | Self::Api(ApiError::RateLimited { .. })
        )
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::Api(ApiError::RateLimited { retry_after_secs, .. }) => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for exegete.
pub type Result<T> = std::result::Result<T, ExegeteError>;
