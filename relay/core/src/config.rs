//! TOML Configuration File Support
//!
//! Configuration for the relay, read from `$XDG_CONFIG_HOME/relay/relay.toml`
//! (typically `~/.config/relay/relay.toml`).
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [engine]
//! batch_size = 30
//! flush_cadence = "exact_multiple"
//! grace_period_secs = 30
//! tool_timeout_secs = 30
//! max_response_tokens = 8192
//!
//! [generator]
//! kind = "ollama"
//! url = "http://localhost:11434"
//! model = "llama3.2"
//!
//! [transport]
//! socket_path = "/run/user/1000/relay/relay.sock"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batching::{BatchingPolicy, FlushCadence, DEFAULT_BATCH_SIZE};
use crate::engine::EngineConfig;
use crate::generator::DEFAULT_OLLAMA_URL;
use crate::streaming::DEFAULT_GRACE_PERIOD;
use crate::tools::DEFAULT_TOOL_TIMEOUT;

/// Default cap on estimated tokens in one assistant response
pub const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 8192;

/// Default model identifier
pub const DEFAULT_MODEL: &str = "llama3.2";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where configuration values came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Which generator backs the engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    /// Ollama chat endpoint
    #[default]
    Ollama,
    /// Echo the user's message back (no model server needed)
    Echo,
}

impl std::str::FromStr for GeneratorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "echo" => Ok(Self::Echo),
            other => Err(ConfigError::ValidationError(format!("unknown generator kind: {other}"))),
        }
    }
}

fn parse_cadence(s: &str) -> Option<FlushCadence> {
    match s.to_ascii_lowercase().as_str() {
        "exact_multiple" | "exact" => Some(FlushCadence::ExactMultiple),
        "boundary_crossing" | "boundary" => Some(FlushCadence::BoundaryCrossing),
        _ => None,
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Engine section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineToml {
    /// Estimated tokens between threshold flushes
    pub batch_size: Option<u32>,
    /// Threshold flush rule
    pub flush_cadence: Option<FlushCadence>,
    /// Retention of completed streams, in seconds
    pub grace_period_secs: Option<u64>,
    /// Bound on one tool execution, in seconds
    pub tool_timeout_secs: Option<u64>,
    /// Cap on estimated tokens in one response
    pub max_response_tokens: Option<u32>,
}

/// Generator section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorToml {
    /// Generator kind
    pub kind: Option<GeneratorKind>,
    /// Ollama base URL
    pub url: Option<String>,
    /// Model identifier
    pub model: Option<String>,
    /// System prompt prepended to every request
    pub system_prompt: Option<String>,
}

/// Transport section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Unix socket path
    pub socket_path: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Engine section
    pub engine: EngineToml,
    /// Generator section
    pub generator: GeneratorToml,
    /// Transport section
    pub transport: TransportToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved relay configuration
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,
    /// Estimated tokens between threshold flushes
    pub batch_size: u32,
    /// Threshold flush rule
    pub flush_cadence: FlushCadence,
    /// Retention of completed streams
    pub grace_period: Duration,
    /// Bound on one tool execution
    pub tool_timeout: Duration,
    /// Cap on estimated tokens in one response
    pub max_response_tokens: u32,
    /// Generator kind
    pub generator: GeneratorKind,
    /// Ollama base URL
    pub ollama_url: String,
    /// Model identifier
    pub model: String,
    /// System prompt
    pub system_prompt: Option<String>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_cadence: FlushCadence::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            generator: GeneratorKind::default(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest-priority source that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_response_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "max_response_tokens must be greater than 0".to_string(),
            ));
        }
        if self.tool_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "tool_timeout must be greater than 0".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".to_string()));
        }
        Ok(())
    }

    /// Engine settings derived from this configuration
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batching: BatchingPolicy {
                batch_size: self.batch_size,
                cadence: self.flush_cadence,
            },
            tool_timeout: self.tool_timeout,
            max_response_tokens: self.max_response_tokens,
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
        }
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path: `$XDG_CONFIG_HOME/relay/relay.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Default socket path: `$XDG_RUNTIME_DIR/relay/relay.sock`, or the temp dir
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("relay")
        .join("relay.sock")
}

/// Load configuration from the default path, then the environment
///
/// A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;
    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(size) = toml.engine.batch_size {
        config.batch_size = size;
    }
    if let Some(cadence) = toml.engine.flush_cadence {
        config.flush_cadence = cadence;
    }
    if let Some(secs) = toml.engine.grace_period_secs {
        config.grace_period = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.engine.tool_timeout_secs {
        config.tool_timeout = Duration::from_secs(secs);
    }
    if let Some(max) = toml.engine.max_response_tokens {
        config.max_response_tokens = max;
    }

    if let Some(kind) = toml.generator.kind {
        config.generator = kind;
    }
    if let Some(ref url) = toml.generator.url {
        config.ollama_url = url.clone();
    }
    if let Some(ref model) = toml.generator.model {
        config.model = model.clone();
    }
    if toml.generator.system_prompt.is_some() {
        config.system_prompt = toml.generator.system_prompt.clone();
    }

    if let Some(ref path) = toml.transport.socket_path {
        config.socket_path = PathBuf::from(path);
    }
}

fn apply_env_config<F>(config: &mut RelayConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env("RELAY_SOCKET") {
        config.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(size) = env("RELAY_BATCH_SIZE").and_then(|v| v.parse::<u32>().ok()) {
        config.batch_size = size;
        config.source = ConfigSource::Env;
    }
    if let Some(cadence) = env("RELAY_FLUSH_CADENCE").and_then(|v| parse_cadence(&v)) {
        config.flush_cadence = cadence;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env("RELAY_GRACE_PERIOD_SECS").and_then(|v| v.parse::<u64>().ok()) {
        config.grace_period = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env("RELAY_TOOL_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
        config.tool_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env("RELAY_MAX_RESPONSE_TOKENS").and_then(|v| v.parse::<u32>().ok()) {
        config.max_response_tokens = max;
        config.source = ConfigSource::Env;
    }
    if let Some(kind) = env("RELAY_GENERATOR") {
        config.generator = kind.parse()?;
        config.source = ConfigSource::Env;
    }
    if let Some(url) = env("RELAY_OLLAMA_URL") {
        config.ollama_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(model) = env("RELAY_MODEL") {
        config.model = model;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,
    /// Generator kind override
    pub generator: Option<GeneratorKind>,
    /// Model override
    pub model: Option<String>,
    /// Ollama URL override
    pub ollama_url: Option<String>,
    /// Batch size override
    pub batch_size: Option<u32>,
    /// Response token cap override
    pub max_response_tokens: Option<u32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set generator override
    #[must_use]
    pub fn with_generator(mut self, kind: GeneratorKind) -> Self {
        self.generator = Some(kind);
        self
    }

    fn is_empty(&self) -> bool {
        self.socket_path.is_none()
            && self.generator.is_none()
            && self.model.is_none()
            && self.ollama_url.is_none()
            && self.batch_size.is_none()
            && self.max_response_tokens.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(ref path) = self.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(kind) = self.generator {
            config.generator = kind;
        }
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        if let Some(ref url) = self.ollama_url {
            config.ollama_url = url.clone();
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(max) = self.max_response_tokens {
            config.max_response_tokens = max;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
