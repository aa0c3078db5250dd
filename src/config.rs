//! Configuration management for the router.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. API key for the completion service.
//! - `COMPLETION_API_URL` - Optional. OpenAI-compatible chat completions endpoint.
//! - `DEFAULT_MODEL` - Optional. Model used when a user has no preferred model.
//! - `COMPLETION_TEMPERATURE` - Optional. Routing prompt temperature. Defaults to `1.0`.
//! - `COMPLETION_MAX_TOKENS` - Optional. Routing prompt token cap. Defaults to `3320`.
//! - `COMPLETION_TIMEOUT_SECS` - Optional. Timeout for every completion call. Defaults to `60`.
//! - `ROUTER_DB_PATH` - Optional. SQLite database file. Defaults to `./agent_router.db`.
//! - `INTERACTION_LOG_LIMIT` - Optional. Interactions kept per app (0 = unbounded). Defaults to `50`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::llm::OPENROUTER_API_URL;

const DEFAULT_MODEL: &str = "meta-llama/llama-3.1-70b-instruct";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Completion call settings.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Chat completions endpoint
    pub api_url: String,

    /// Sampling temperature for routing prompts
    pub temperature: f64,

    /// Maximum output tokens for routing prompts
    pub max_tokens: u64,

    /// Upper bound for a single completion call
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_url: OPENROUTER_API_URL.to_string(),
            temperature: 1.0,
            max_tokens: 3320,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Completion service API key
    pub api_key: String,

    /// Default LLM model identifier
    pub default_model: String,

    /// Completion call settings
    pub completion: CompletionConfig,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Number of interactions kept in each app's rolling log (0 keeps all)
    pub interaction_log_limit: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let api_url = std::env::var("COMPLETION_API_URL")
            .unwrap_or_else(|_| OPENROUTER_API_URL.to_string());

        let temperature: f64 = parse_var("COMPLETION_TEMPERATURE", "1.0")?;
        let max_tokens: u64 = parse_var("COMPLETION_MAX_TOKENS", "3320")?;
        let timeout_secs: u64 = parse_var("COMPLETION_TIMEOUT_SECS", "60")?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "COMPLETION_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let db_path = std::env::var("ROUTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./agent_router.db"));

        let interaction_log_limit = parse_var("INTERACTION_LOG_LIMIT", "50")?;

        Ok(Self {
            api_key,
            default_model,
            completion: CompletionConfig {
                api_url,
                temperature,
                max_tokens,
                timeout: Duration::from_secs(timeout_secs),
            },
            db_path,
            interaction_log_limit,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            api_key,
            default_model,
            completion: CompletionConfig::default(),
            db_path: PathBuf::from("./agent_router.db"),
            interaction_log_limit: 50,
        }
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
