//! Client for OpenAI-compatible *completions* endpoints.
//!
//! The legacy completions route is the only OpenAI-compatible surface
//! that exposes `echo` and per-token `logprobs`, which the scorer and the
//! suffix decoder are built on. Chat routes cannot score caller-supplied
//! text, so this client speaks completions exclusively. OpenRouter,
//! vLLM, TGI, and llama.cpp all serve it.

use crate::client::RateLimiter;
use crate::models::{ApiError, Config, ExegeteError, ModelSpec, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sampling parameters for free-running generation.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    /// Completions sampled per prompt
    pub n: u32,
    pub stop: Option<Vec<String>>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 16,
            temperature: 1.0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            n: 1,
            stop: None,
        }
    }
}

/// A prompt is either one string or a batch of strings.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum PromptInput {
    One(String),
    Many(Vec<String>),
}

/// Completions request payload.
#[derive(Debug, Serialize)]
struct CompletionsRequest {
    model: String,
    prompt: PromptInput,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

/// Completions response.
#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
    index: usize,
    logprobs: Option<TokenLogprobs>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}

/// Per-token log-probabilities in the legacy completions shape.
///
/// Under `echo=true` the first entry of `token_logprobs` is null (there
/// is no context to condition on). `text_offset` counts characters from
/// the start of the submitted text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogprobs {
    pub tokens: Vec<String>,
    pub token_logprobs: Vec<Option<f64>>,
    #[serde(default)]
    pub top_logprobs: Option<Vec<Option<HashMap<String, f64>>>>,
    pub text_offset: Vec<usize>,
}

/// One sampled continuation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub index: usize,
    pub logprobs: Option<TokenLogprobs>,
}

/// Top-K next-token candidates for one text.
#[derive(Debug, Clone)]
pub struct TopKNextToken {
    /// (token, logprob) pairs, highest probability first
    pub tokens: Vec<(String, f64)>,
}

/// Client for one OpenAI-compatible completions endpoint.
///
/// Features:
/// - Automatic rate limit handling with adaptive backoff
/// - Response header parsing for proactive throttling
/// - Cost and token tracking
/// - Retry with exponential backoff
/// - Custom headers for auth flexibility
pub struct CompletionsClient {
    client: reqwest::Client,
    /// Name of this endpoint (for logging)
    name: String,
    /// API key (None for local endpoints without auth)
    api_key: Option<String>,
    /// Base URL for the API
    base_url: String,
    /// Custom headers to include in requests
    custom_headers: HashMap<String, String>,
    /// Request timeout
    timeout: Duration,
    /// Maximum retries on failure
    max_retries: u32,
    /// Rate limiter
    rate_limiter: Arc<RateLimiter>,
    // Usage tracking
    total_requests: AtomicU64,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
    total_cost_micros: AtomicU64, // Store as microdollars for atomic ops
}

impl CompletionsClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// - `name`: Endpoint name for logging (e.g., "openrouter", "local")
    /// - `api_key`: Optional API key (None for local endpoints)
    /// - `base_url`: Base URL for the API
    /// - `custom_headers`: Additional headers to include in requests
    /// - `timeout_secs`: Request timeout in seconds
    /// - `max_retries`: Maximum retry attempts
    /// - `rate_limiter`: Optional shared rate limiter
    pub fn new(
        name: String,
        api_key: Option<String>,
        base_url: String,
        custom_headers: HashMap<String, String>,
        timeout_secs: u64,
        max_retries: u32,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ExegeteError::Network)?;

        Ok(Self {
            client,
            name,
            api_key,
            base_url,
            custom_headers,
            timeout,
            max_retries,
            rate_limiter: rate_limiter.unwrap_or_else(|| Arc::new(RateLimiter::new())),
            total_requests: AtomicU64::new(0),
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
            total_cost_micros: AtomicU64::new(0),
        })
    }

    /// Build a client for a named endpoint from config, resolving API keys
    /// and expanding `${VAR}` placeholders in custom headers.
    pub fn for_endpoint(
        config: &Config,
        endpoint_name: &str,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Self> {
        if endpoint_name == "openrouter" {
            let or = &config.openrouter;
            return Self::new(
                "openrouter".to_string(),
                Some(config.resolve_api_key()?),
                or.base_url.clone(),
                HashMap::new(),
                or.timeout_secs,
                or.max_retries,
                rate_limiter,
            );
        }

        let endpoint = config.endpoints.get(endpoint_name).ok_or_else(|| {
            crate::models::ConfigError::EndpointNotFound(endpoint_name.to_string())
        })?;

        Self::new(
            endpoint_name.to_string(),
            config.resolve_endpoint_api_key(endpoint_name)?,
            endpoint.base_url.clone(),
            crate::models::expand_headers(&endpoint.headers),
            endpoint.timeout_secs,
            endpoint.max_retries,
            rate_limiter,
        )
    }

    /// Get the endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the rate limiter.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Build headers for a request.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // Add Authorization header if API key is present
        if let Some(ref api_key) = self.api_key {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // OpenRouter attribution headers (harmless for other providers)
        headers.insert(
            "HTTP-Referer",
            HeaderValue::from_static("https://github.com/exegete-research/exegete"),
        );
        headers.insert("X-Title", HeaderValue::from_static("exegete"));

        // Add custom headers
        for (key, value) in &self.custom_headers {
            if let (Ok(name), Ok(val)) = (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        headers
    }

    /// Calculate cost for a request.
    fn calculate_cost(&self, model: &ModelSpec, input_tokens: u32, output_tokens: u32) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * model.input_price_per_1m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * model.output_price_per_1m;
        input_cost + output_cost
    }

    /// POST a completions request with retry, rate limiting, and cost
    /// tracking. Choices are returned sorted by `index`.
    async fn post_completions(
        &self,
        model: &ModelSpec,
        request: &CompletionsRequest,
    ) -> Result<Vec<CompletionChoice>> {
        let start = Instant::now();
        let url = format!("{}/completions", self.base_url);
        let mut last_error: Option<ExegeteError> = None;

        for attempt in 0..self.max_retries {
            // Wait if rate limited
            self.rate_limiter.wait_if_needed(&model.id).await;

            let response = self
                .client
                .post(&url)
                .headers(self.headers())
                .json(request)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    if e.is_timeout() {
                        last_error = Some(ExegeteError::Timeout(self.timeout));
                    } else {
                        last_error = Some(ExegeteError::Network(e));
                    }
                    if attempt < self.max_retries - 1 {
                        let backoff = Duration::from_secs(2u64.pow(attempt));
                        debug!(
                            endpoint = %self.name,
                            attempt = attempt,
                            backoff_secs = backoff.as_secs(),
                            "Retrying after network error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    continue;
                }
            };

            let status = response.status().as_u16();
            let headers = response.headers().clone();

            // Update rate limiter from headers
            self.rate_limiter.record_request(&model.id, status, &headers);

            // Handle rate limiting
            if status == 429 {
                let retry_after = headers
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(1.0);

                last_error = Some(ExegeteError::RateLimited {
                    retry_after_secs: retry_after,
                });

                if attempt < self.max_retries - 1 {
                    debug!(
                        endpoint = %self.name,
                        attempt = attempt,
                        retry_after_secs = retry_after,
                        "Rate limited, waiting"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(retry_after)).await;
                }
                continue;
            }

            // Handle other errors
            if !response.status().is_success() {
                let error_body = response.text().await.unwrap_or_default();
                let error =
                    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
                        if status == 401 {
                            ApiError::AuthenticationFailed
                        } else if status == 404 {
                            ApiError::ModelNotFound(model.id.clone())
                        } else {
                            ApiError::Status {
                                status,
                                message: api_error.error.message,
                            }
                        }
                    } else {
                        ApiError::Status {
                            status,
                            message: error_body,
                        }
                    };

                last_error = Some(ExegeteError::Api(error));

                // Don't retry auth errors or not found
                if status == 401 || status == 404 {
                    break;
                }

                if attempt < self.max_retries - 1 {
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }

            // Parse successful response
            let body: CompletionsResponse = response
                .json()
                .await
                .map_err(|e| ExegeteError::ParseError(format!("Failed to parse response: {e}")))?;

            if body.choices.is_empty() {
                return Err(ExegeteError::Api(ApiError::InvalidResponse(
                    "no choices in response".to_string(),
                )));
            }

            let usage = body.usage.unwrap_or(Usage {
                prompt_tokens: 0,
                completion_tokens: 0,
            });
            let cost = self.calculate_cost(model, usage.prompt_tokens, usage.completion_tokens);

            // Update tracking
            self.total_requests.fetch_add(1, Ordering::Relaxed);
            self.total_input_tokens
                .fetch_add(usage.prompt_tokens as u64, Ordering::Relaxed);
            self.total_output_tokens
                .fetch_add(usage.completion_tokens as u64, Ordering::Relaxed);
            self.total_cost_micros
                .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);

            debug!(
                endpoint = %self.name,
                model = %model.id,
                choices = body.choices.len(),
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                duration_ms = start.elapsed().as_millis() as u64,
                "Completions request succeeded"
            );

            let mut choices = body.choices;
            choices.sort_by_key(|c| c.index);
            return Ok(choices);
        }

        // All retries exhausted
        Err(last_error.unwrap_or_else(|| {
            ExegeteError::Api(ApiError::MaxRetriesExceeded {
                attempts: self.max_retries,
                last_error: "Unknown error".to_string(),
            })
        }))
    }

    /// Sample `params.n` stochastic continuations of one prompt.
    pub async fn sample(
        &self,
        model: &ModelSpec,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<Vec<Completion>> {
        let request = CompletionsRequest {
            model: model.id.clone(),
            prompt: PromptInput::One(prompt.to_string()),
            max_tokens: params.max_tokens.min(model.max_tokens),
            temperature: Some(params.temperature),
            top_p: Some(params.top_p),
            frequency_penalty: Some(params.frequency_penalty),
            n: Some(params.n),
            logprobs: None,
            echo: false,
            stop: params.stop.clone(),
        };

        let choices = self.post_completions(model, &request).await?;
        Ok(choices
            .into_iter()
            .map(|c| Completion {
                text: c.text,
                index: c.index,
                logprobs: c.logprobs,
            })
            .collect())
    }

    /// Score a batch of texts: per-token logprobs of every submitted
    /// character, via `echo=true, max_tokens=0`. Results are in input
    /// order.
    pub async fn echo_logprobs(
        &self,
        model: &ModelSpec,
        texts: &[String],
    ) -> Result<Vec<TokenLogprobs>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CompletionsRequest {
            model: model.id.clone(),
            prompt: PromptInput::Many(texts.to_vec()),
            max_tokens: 0,
            temperature: Some(0.0),
            top_p: None,
            frequency_penalty: None,
            n: None,
            logprobs: Some(1),
            echo: true,
            stop: None,
        };

        let choices = self.post_completions(model, &request).await?;
        if choices.len() != texts.len() {
            return Err(ExegeteError::Api(ApiError::InvalidResponse(format!(
                "submitted {} texts, got {} choices",
                texts.len(),
                choices.len()
            ))));
        }

        choices
            .into_iter()
            .map(|c| c.logprobs.ok_or(ExegeteError::Api(ApiError::EchoUnsupported)))
            .collect()
    }

    /// Top-K next-token candidates for each text, via
    /// `max_tokens=1, logprobs=k`. Results are in input order.
    pub async fn next_token_topk(
        &self,
        model: &ModelSpec,
        texts: &[String],
        k: u32,
    ) -> Result<Vec<TopKNextToken>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = CompletionsRequest {
            model: model.id.clone(),
            prompt: PromptInput::Many(texts.to_vec()),
            max_tokens: 1,
            temperature: Some(0.0),
            top_p: None,
            frequency_penalty: None,
            n: None,
            logprobs: Some(k),
            echo: false,
            stop: None,
        };

        let choices = self.post_completions(model, &request).await?;
        if choices.len() != texts.len() {
            return Err(ExegeteError::Api(ApiError::InvalidResponse(format!(
                "submitted {} texts, got {} choices",
                texts.len(),
                choices.len()
            ))));
        }

        choices
            .into_iter()
            .map(|c| {
                let lp = c
                    .logprobs
                    .ok_or_else(|| {
                        ExegeteError::Api(ApiError::InvalidResponse(
                            "logprobs missing from next-token response".to_string(),
                        ))
                    })?;
                let map = lp
                    .top_logprobs
                    .as_ref()
                    .and_then(|tl| tl.first())
                    .and_then(|m| m.as_ref())
                    .ok_or_else(|| {
                        ExegeteError::Api(ApiError::InvalidResponse(
                            "top_logprobs missing from next-token response".to_string(),
                        ))
                    })?;

                let mut tokens: Vec<(String, f64)> =
                    map.iter().map(|(t, lp)| (t.clone(), *lp)).collect();
                tokens.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                Ok(TopKNextToken { tokens })
            })
            .collect()
    }

    /// Get total requests issued.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get total cost tracked.
    pub fn total_cost_usd(&self) -> f64 {
        self.total_cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Get total tokens tracked.
    pub fn total_tokens(&self) -> (u64, u64) {
        (
            self.total_input_tokens.load(Ordering::Relaxed),
            self.total_output_tokens.load(Ordering::Relaxed),
        )
    }

    /// Reset cost tracking.
    pub fn reset_tracking(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_input_tokens.store(0, Ordering::Relaxed);
        self.total_output_tokens.store(0, Ordering::Relaxed);
        self.total_cost_micros.store(0, Ordering::Relaxed);
    }

    /// Health check: ping the /models endpoint.
    pub async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let url = format!("{}/models", self.base_url);

        match self
            .client
            .get(&url)
            .headers(self.headers())
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    HealthCheckResult {
                        endpoint: self.name.clone(),
                        status: HealthStatus::Healthy,
                        latency_ms: Some(latency_ms),
                        error: None,
                    }
                } else {
                    HealthCheckResult {
                        endpoint: self.name.clone(),
                        status: HealthStatus::Unhealthy,
                        latency_ms: Some(latency_ms),
                        error: Some(format!("HTTP {}", response.status().as_u16())),
                    }
                }
            }
            Err(e) => HealthCheckResult {
                endpoint: self.name.clone(),
                status: HealthStatus::Unreachable,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Health check result.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Endpoint name
    pub endpoint: String,
    /// Health status
    pub status: HealthStatus,
    /// Latency in milliseconds (if reachable)
    pub latency_ms: Option<u64>,
    /// Error message (if unhealthy or unreachable)
    pub error: Option<String>,
}

/// Health status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Endpoint is responding normally
    Healthy,
    /// Endpoint is responding but with errors
    Unhealthy,
    /// Endpoint is not reachable
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_prompt_serializes_as_string() {
        let request = CompletionsRequest {
            model: "m".to_string(),
            prompt: PromptInput::One("hello".to_string()),
            max_tokens: 8,
            temperature: Some(1.0),
            top_p: Some(1.0),
            frequency_penalty: Some(0.5),
            n: Some(4),
            logprobs: None,
            echo: false,
            stop: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["prompt"], "hello");
        assert_eq!(json["n"], 4);
        assert!(json.get("echo").is_none());
        assert!(json.get("logprobs").is_none());
    }

    #[test]
    fn echo_request_serializes_array_prompt() {
        let request = CompletionsRequest {
            model: "m".to_string(),
            prompt: PromptInput::Many(vec!["a".to_string(), "b".to_string()]),
            max_tokens: 0,
            temperature: Some(0.0),
            top_p: None,
            frequency_penalty: None,
            n: None,
            logprobs: Some(1),
            echo: true,
            stop: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["prompt"].as_array().unwrap().len(), 2);
        assert_eq!(json["max_tokens"], 0);
        assert_eq!(json["echo"], true);
        assert_eq!(json["logprobs"], 1);
    }

    #[test]
    fn token_logprobs_parses_null_first_entry() {
        let raw = r#"{
            "tokens": ["Input", ":", " 7"],
            "token_logprobs": [null, -0.5, -1.25],
            "top_logprobs": null,
            "text_offset": [0, 5, 6]
        }"#;
        let lp: TokenLogprobs = serde_json::from_str(raw).unwrap();
        assert_eq!(lp.tokens.len(), 3);
        assert!(lp.token_logprobs[0].is_none());
        assert_eq!(lp.token_logprobs[2], Some(-1.25));
        assert_eq!(lp.text_offset[2], 6);
    }
}
