//! Configuration models for exegete.
//!
//! Everything tunable about a run lives here and resolves from a single
//! TOML file plus environment variables for secrets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for exegete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OpenRouter API configuration (primary endpoint, backward compatible)
    pub openrouter: OpenRouterConfig,

    /// Additional endpoints for on-prem or other aggregators (optional)
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    /// Proposer model: samples candidate prompts
    pub proposer: ProposerConfig,

    /// Scorer model: reranks candidates by data likelihood
    pub scorer: ScorerConfig,

    /// Iterative search settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Suffix beam decoding settings
    #[serde(default)]
    pub suffix: SuffixConfig,

    /// Dataset handling and rendering
    #[serde(default)]
    pub data: DataConfig,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,
}

/// OpenRouter API configuration (primary endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// API key (can also be set via OPENROUTER_API_KEY env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_openrouter_api_key_env")]
    pub api_key_env: String,

    /// Base URL for OpenRouter API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries on failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_openrouter_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    3
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_openrouter_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Configuration for an additional LLM endpoint.
///
/// Supports on-prem (vLLM, TGI, llama.cpp) and other aggregators
/// (Together AI, Fireworks). The endpoint must expose the legacy
/// completions route with `echo` and `logprobs`; chat-only endpoints
/// cannot score text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for the API (e.g., "http://localhost:8000/v1")
    pub base_url: String,

    /// API key (optional, can be omitted for local endpoints)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Custom headers to include in requests
    /// Values can contain ${ENV_VAR} for environment variable expansion
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout in seconds (default: 180)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries on failure (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            api_key_env: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Specification for a model.
///
/// Model ID format depends on the endpoint:
/// - OpenRouter: "provider/model" (e.g., "meta-llama/llama-3.1-70b")
/// - vLLM/llama.cpp: model name as loaded (e.g., "gpt-neo-2.7B")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Endpoint name (default: "openrouter")
    /// References [openrouter] or [endpoints.<name>] in config
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Model ID
    pub id: String,

    /// Human-readable label
    #[serde(default)]
    pub label: Option<String>,

    /// Input price per 1M tokens (USD) - set to 0 for on-prem
    #[serde(default)]
    pub input_price_per_1m: f64,

    /// Output price per 1M tokens (USD) - set to 0 for on-prem
    #[serde(default)]
    pub output_price_per_1m: f64,

    /// Hard cap on completion tokens for this model
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_endpoint() -> String {
    "openrouter".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

impl ModelSpec {
    /// Display name for logs: label if set, otherwise the model id.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// Proposer configuration: the model that writes candidate prompts and
/// the sampling parameters it runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerConfig {
    /// Model used to sample candidate prompts
    pub model: ModelSpec,

    /// Sampling temperature for candidate generation
    #[serde(default = "default_generation_temperature")]
    pub temperature: f64,

    /// Nucleus sampling mass
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Frequency penalty; discourages the proposer from echoing the data
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f64,

    /// Token budget per sampled candidate
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: u32,

    /// Text placed after the rendered demonstrations to elicit a candidate.
    /// The stem itself is not part of the candidate.
    #[serde(default = "default_generation_stem")]
    pub generation_stem: String,

    /// Fixed text prepended to every candidate (e.g. "Return the")
    #[serde(default)]
    pub seed_text: String,

    /// Character cap applied to candidates after post-processing
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

fn default_generation_temperature() -> f64 {
    1.0
}

fn default_top_p() -> f64 {
    1.0
}

fn default_frequency_penalty() -> f64 {
    1.0
}

fn default_max_prompt_tokens() -> u32 {
    16
}

fn default_generation_stem() -> String {
    "To compute the output from the input, ".to_string()
}

fn default_max_prompt_chars() -> usize {
    200
}

/// Scorer configuration: the frozen model whose likelihoods rank prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Model whose echo logprobs score candidates
    pub model: ModelSpec,

    /// Texts per array-prompt scoring request
    #[serde(default = "default_score_batch_size")]
    pub batch_size: usize,

    /// Concurrent scoring requests in flight
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Completion budget for the greedy accuracy probe
    #[serde(default = "default_accuracy_max_tokens")]
    pub accuracy_max_tokens: u32,
}

fn default_score_batch_size() -> usize {
    8
}

fn default_max_concurrency() -> usize {
    4
}

fn default_accuracy_max_tokens() -> u32 {
    16
}

/// Iterative search settings. Population defaults follow the reference
/// hyperparameters for interpretable autoprompting (population 8, four
/// mutations, four fresh generations per step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Survivors carried between steps
    #[serde(default = "default_population_size")]
    pub population_size: usize,

    /// Mutated candidates proposed per step
    #[serde(default = "default_num_mutations")]
    pub num_mutations: usize,

    /// Fresh candidates proposed per step
    #[serde(default = "default_num_random_generations")]
    pub num_random_generations: usize,

    /// Examples scored per candidate per step
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Examples rendered into each demonstration block
    #[serde(default = "default_n_shots")]
    pub n_shots: usize,

    /// With multi-shot blocks, score only the final shot's output
    #[serde(default)]
    pub single_shot_loss: bool,

    /// Stop after this many steps without improvement (0 disables)
    #[serde(default)]
    pub early_stopping_rounds: usize,

    /// Hard step cap
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Hard cap on examples consumed across all steps (0 disables)
    #[serde(default)]
    pub max_examples: usize,

    /// Abort once accumulated API cost crosses this (0 disables)
    #[serde(default)]
    pub max_cost_usd: f64,

    /// RNG seed for batch order and mutation points
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Steps between checkpoint writes
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,
}

fn default_population_size() -> usize {
    8
}

fn default_num_mutations() -> usize {
    4
}

fn default_num_random_generations() -> usize {
    4
}

fn default_batch_size() -> usize {
    8
}

fn default_n_shots() -> usize {
    1
}

fn default_max_steps() -> usize {
    100
}

fn default_seed() -> u64 {
    1
}

fn default_save_interval() -> usize {
    1
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            num_mutations: default_num_mutations(),
            num_random_generations: default_num_random_generations(),
            batch_size: default_batch_size(),
            n_shots: default_n_shots(),
            single_shot_loss: false,
            early_stopping_rounds: 0,
            max_steps: default_max_steps(),
            max_examples: 0,
            max_cost_usd: 0.0,
            seed: default_seed(),
            save_interval: default_save_interval(),
        }
    }
}

/// Suffix beam decoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuffixConfig {
    /// Suffixes extended at each depth
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    /// Extra tokens scanned for a pattern match but never extended
    #[serde(default = "default_beam_width_extra")]
    pub beam_width_extra: usize,

    /// Maximum suffix length in tokens
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Next-token candidates requested per example
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Keep stopword tokens as beam extensions
    #[serde(default)]
    pub allow_stopwords: bool,

    /// Examples averaged per expansion (0 = whole dataset)
    #[serde(default = "default_suffix_max_examples")]
    pub max_examples: usize,

    /// Hard cap on frontier expansions, i.e. next-token requests
    /// (0 disables). The tree is otherwise beam_width^max_new_tokens.
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
}

fn default_beam_width() -> usize {
    4
}

fn default_beam_width_extra() -> usize {
    8
}

fn default_max_new_tokens() -> usize {
    6
}

fn default_top_k() -> usize {
    20
}

fn default_suffix_max_examples() -> usize {
    32
}

fn default_max_expansions() -> usize {
    500
}

impl Default for SuffixConfig {
    fn default() -> Self {
        Self {
            beam_width: default_beam_width(),
            beam_width_extra: default_beam_width_extra(),
            max_new_tokens: default_max_new_tokens(),
            top_k: default_top_k(),
            allow_stopwords: false,
            max_examples: default_suffix_max_examples(),
            max_expansions: default_max_expansions(),
        }
    }
}

/// Dataset handling and rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Fraction of examples held out for evaluation (None = no split)
    #[serde(default)]
    pub train_split_frac: Option<f64>,

    /// Cap on dataset size after loading (0 disables)
    #[serde(default = "default_max_dataset_size")]
    pub max_dataset_size: usize,

    /// Text before each input
    #[serde(default = "default_input_prefix")]
    pub input_prefix: String,

    /// Text before each output
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Text between rendered examples
    #[serde(default = "default_example_separator")]
    pub example_separator: String,
}

fn default_max_dataset_size() -> usize {
    10_000
}

fn default_input_prefix() -> String {
    "Input: ".to_string()
}

fn default_output_prefix() -> String {
    "Output: ".to_string()
}

fn default_example_separator() -> String {
    "\n\n".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_split_frac: None,
            max_dataset_size: default_max_dataset_size(),
            input_prefix: default_input_prefix(),
            output_prefix: default_output_prefix(),
            example_separator: default_example_separator(),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory run artifacts are written under
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Whether to track costs
    #[serde(default = "default_true")]
    pub track_costs: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_true() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            track_costs: default_true(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Resolve API key from config or environment for OpenRouter.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        // First check explicit api_key in config
        if let Some(key) = &self.openrouter.api_key {
            return Ok(expand_env_vars(key));
        }

        // Then check environment variable
        std::env::var(&self.openrouter.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            endpoint: "openrouter".to_string(),
            env_var: self.openrouter.api_key_env.clone(),
        })
    }

    /// Resolve API key for a specific endpoint.
    pub fn resolve_endpoint_api_key(
        &self,
        endpoint_name: &str,
    ) -> Result<Option<String>, ConfigError> {
        if endpoint_name == "openrouter" {
            return Ok(Some(self.resolve_api_key()?));
        }

        let endpoint = self
            .endpoints
            .get(endpoint_name)
            .ok_or_else(|| ConfigError::EndpointNotFound(endpoint_name.to_string()))?;

        // Check explicit api_key
        if let Some(key) = &endpoint.api_key {
            return Ok(Some(expand_env_vars(key)));
        }

        // Check environment variable
        if let Some(env_var) = &endpoint.api_key_env {
            match std::env::var(env_var) {
                Ok(key) => return Ok(Some(key)),
                Err(_) => {
                    return Err(ConfigError::MissingApiKey {
                        endpoint: endpoint_name.to_string(),
                        env_var: env_var.clone(),
                    });
                }
            }
        }

        // No API key configured (valid for local endpoints)
        Ok(None)
    }

    /// Get all unique endpoint names referenced by models.
    pub fn referenced_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = [&self.proposer.model, &self.scorer.model]
            .iter()
            .map(|m| m.endpoint.clone())
            .collect();
        endpoints.sort();
        endpoints.dedup();
        endpoints
    }

    /// Validate that all referenced endpoints are configured.
    pub fn validate_endpoints(&self) -> Result<(), ConfigError> {
        for endpoint in self.referenced_endpoints() {
            if endpoint != "openrouter" && !self.endpoints.contains_key(&endpoint) {
                return Err(ConfigError::EndpointNotFound(endpoint));
            }
        }
        Ok(())
    }

    /// Validate numeric settings that serde cannot range-check.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.search.population_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "search.population_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.search.n_shots == 0 {
            return Err(ConfigError::InvalidValue {
                field: "search.n_shots".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.search.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "search.batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(frac) = self.data.train_split_frac {
            if !(0.0 < frac && frac < 1.0) {
                return Err(ConfigError::InvalidValue {
                    field: "data.train_split_frac".to_string(),
                    reason: "must be strictly between 0 and 1".to_string(),
                });
            }
        }
        if self.suffix.beam_width == 0 {
            return Err(ConfigError::InvalidValue {
                field: "suffix.beam_width".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(
        "Missing API key for endpoint '{endpoint}': set {env_var} env var or api_key in config"
    )]
    MissingApiKey { endpoint: String, env_var: String },

    #[error("Endpoint not found: '{0}' (referenced by model but not configured in [endpoints.*])")]
    EndpointNotFound(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[openrouter]
api_key = "sk-test"

[proposer.model]
id = "meta-llama/llama-3.1-70b"

[scorer.model]
id = "eleutherai/gpt-neo-2.7b"
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.search.population_size, 8);
        assert_eq!(config.search.num_mutations, 4);
        assert_eq!(config.search.num_random_generations, 4);
        assert_eq!(config.proposer.temperature, 1.0);
        assert_eq!(config.proposer.top_p, 1.0);
        assert_eq!(config.scorer.batch_size, 8);
        assert_eq!(config.suffix.beam_width, 4);
        assert_eq!(config.data.input_prefix, "Input: ");
        assert_eq!(config.output.dir, PathBuf::from("runs"));
        assert!(config.output.track_costs);
    }

    #[test]
    fn referenced_endpoints_dedup() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.referenced_endpoints(), vec!["openrouter"]);
        config.validate_endpoints().unwrap();
    }

    #[test]
    fn unknown_endpoint_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.scorer.model.endpoint = "vllm".to_string();
        assert!(matches!(
            config.validate_endpoints(),
            Err(ConfigError::EndpointNotFound(name)) if name == "vllm"
        ));
    }

    #[test]
    fn settings_range_checked() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.data.train_split_frac = Some(1.5);
        assert!(config.validate_settings().is_err());

        config.data.train_split_frac = Some(0.75);
        config.validate_settings().unwrap();

        config.search.population_size = 0;
        assert!(config.validate_settings().is_err());
    }

    #[test]
    fn env_expansion_leaves_unset_placeholders() {
        std::env::set_var("EXEGETE_TEST_TOKEN", "tok-123");
        assert_eq!(
            expand_env_vars("Bearer ${EXEGETE_TEST_TOKEN}"),
            "Bearer tok-123"
        );
        assert_eq!(
            expand_env_vars("${EXEGETE_TEST_UNSET_VAR}"),
            "${EXEGETE_TEST_UNSET_VAR}"
        );
        std::env::remove_var("EXEGETE_TEST_TOKEN");
    }

    #[test]
    fn api_key_resolution_prefers_config() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.resolve_api_key().unwrap(), "sk-test");
    }
}
