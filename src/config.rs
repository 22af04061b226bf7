//! Configuration management for cloudchat.
//!
//! Configuration can be set via environment variables:
//! - `ANTHROPIC_API_KEY` - Required. API key for the model backend.
//! - `MODEL` - Optional. Model identifier. Defaults to `claude-3-5-sonnet-20241022`.
//! - `MAX_TOKENS` - Optional. Completion token budget per model call. Defaults to `1000`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `5000`.
//! - `HISTORY_FILE` - Optional. Chat history document. Defaults to `chat_history.json`.
//! - `MCP_COMMAND` - Optional. Command line spawning the tool server process.
//! - `SAFETY_LIMIT` - Optional. Hard ceiling on loop iterations. Defaults to `100`.
//! - `STALL_WINDOW` - Optional. Identical-signature iterations that count as a
//!   stall. Defaults to `3`.
//! - `COMPLETION_GRACE` - Optional. Consecutive tool-free responses that end a
//!   run. Defaults to `2`.
//! - `MODEL_TIMEOUT_SECS` / `TOOL_TIMEOUT_SECS` - Optional. Per-call timeouts.
//! - `AZURE_CREDENTIALS` - Optional. Whole credentials JSON for the tool server.
//! - `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`, `AZURE_SUBSCRIPTION_ID`,
//!   `AZURE_TENANT_ID` - Optional. Individual credential parts, used when the
//!   whole document is not set.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Termination policy for the agent loop.
///
/// The stall window and completion grace are heuristics: they trade a little
/// tail latency for protection against infinite tool repetition and premature
/// truncation respectively. The safety limit is the only hard bound on model
/// calls per request.
#[derive(Debug, Clone, Copy)]
pub struct LoopPolicy {
    /// Unconditional maximum number of loop iterations per request.
    pub safety_limit: usize,

    /// How many consecutive identical tool signatures classify as a stall.
    pub stall_window: usize,

    /// How many consecutive tool-free responses end a run. Two tolerates a
    /// closing remark before the real final answer.
    pub completion_grace: usize,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            safety_limit: 100,
            stall_window: 3,
            completion_grace: 2,
        }
    }
}

/// Credentials handed to the tool server process.
#[derive(Debug, Clone, Default)]
pub struct CloudCredentials {
    /// Whole credentials document; takes precedence over the parts.
    pub credentials_json: Option<String>,

    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the model backend
    pub api_key: String,

    /// Model identifier
    pub model: String,

    /// Completion token budget per model call
    pub max_tokens: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Chat history document path
    pub history_file: PathBuf,

    /// Command line for the MCP tool server process
    pub mcp_command: String,

    /// Agent loop termination policy
    pub policy: LoopPolicy,

    /// Timeout for one model round trip
    pub model_timeout: Duration,

    /// Timeout for one tool invocation
    pub tool_timeout: Duration,

    /// Credentials for the tool server
    pub credentials: CloudCredentials,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `ANTHROPIC_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

        let model = std::env::var("MODEL")
            .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let history_file = std::env::var("HISTORY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("chat_history.json"));

        let mcp_command = std::env::var("MCP_COMMAND").unwrap_or_else(|_| {
            "docker run -i --rm -e AZURE_CREDENTIALS azure-cli-mcp".to_string()
        });

        let policy = LoopPolicy {
            safety_limit: parse_env("SAFETY_LIMIT", 100)?,
            stall_window: parse_env("STALL_WINDOW", 3)?,
            completion_grace: parse_env("COMPLETION_GRACE", 2)?,
        };

        let credentials = CloudCredentials {
            credentials_json: std::env::var("AZURE_CREDENTIALS").ok(),
            client_id: std::env::var("AZURE_CLIENT_ID").ok(),
            client_secret: std::env::var("AZURE_CLIENT_SECRET").ok(),
            subscription_id: std::env::var("AZURE_SUBSCRIPTION_ID").ok(),
            tenant_id: std::env::var("AZURE_TENANT_ID").ok(),
        };

        Ok(Self {
            api_key,
            model,
            max_tokens: parse_env("MAX_TOKENS", 1000)?,
            host,
            port: parse_env("PORT", 5000)?,
            history_file,
            mcp_command,
            policy,
            model_timeout: Duration::from_secs(parse_env("MODEL_TIMEOUT_SECS", 60)?),
            tool_timeout: Duration::from_secs(parse_env("TOOL_TIMEOUT_SECS", 30)?),
            credentials,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            max_tokens: 1000,
            host: "127.0.0.1".to_string(),
            port: 5000,
            history_file: PathBuf::from("chat_history.json"),
            mcp_command: "docker run -i --rm -e AZURE_CREDENTIALS azure-cli-mcp".to_string(),
            policy: LoopPolicy::default(),
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            credentials: CloudCredentials::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}
