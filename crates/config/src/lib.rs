//! Configuration loading, validation, and management for AgentRail.
//!
//! Loads configuration from `~/.agentrail/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use agentrail_core::SessionSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.agentrail/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Agent loop behavior
    #[serde(default)]
    pub agent: AgentConfig,

    /// Progress broadcasting
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Conversation persistence
    #[serde(default)]
    pub store: StoreConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("progress", &self.progress)
            .field("tools", &self.tools)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .field("providers", &self.providers)
            .finish()
    }
}

/// Agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iteration bound per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Extra instructions appended to the system prompt
    #[serde(default)]
    pub guidelines: String,

    /// Run multi-call batches concurrently
    #[serde(default = "default_true")]
    pub parallel_tool_execution: bool,

    /// Retries per tool call for transient errors
    #[serde(default = "default_tool_retry_budget")]
    pub tool_retry_budget: u32,

    /// Base of the exponential backoff; attempt n waits base * 2^n
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// Failures after which a tool is withdrawn from the session
    #[serde(default = "default_tool_failure_threshold")]
    pub tool_failure_threshold: u32,

    /// Run the completion verifier on candidate answers
    #[serde(default = "default_true")]
    pub verify_completion: bool,

    /// Consecutive failed verifications before the run is forced incomplete
    #[serde(default = "default_max_verification_failures")]
    pub max_verification_failures: u32,

    /// Retries of a single verifier call that errored
    #[serde(default = "default_verification_retries")]
    pub verification_retries: u32,

    #[serde(default = "default_verifier_timeout_secs")]
    pub verifier_timeout_secs: u64,

    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Empty model responses tolerated before giving up
    #[serde(default = "default_max_empty_responses")]
    pub max_empty_responses: u32,

    /// Corrective nudges for non-deliverable answers
    #[serde(default = "default_max_nudges")]
    pub max_nudges: u32,

    /// Token budget for the assembled prompt
    #[serde(default = "default_context_max_tokens")]
    pub context_max_tokens: usize,

    /// Stream model output to observers while it is generated
    #[serde(default)]
    pub stream_responses: bool,

    /// Tools whose calls wait for a human approval
    #[serde(default)]
    pub approval_required: Vec<String>,

    /// Tool allow-list. Empty allows every registered tool.
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Thresholds for the deliverable/status-update heuristic
    #[serde(default)]
    pub deliverable: DeliverableConfig,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_tool_retry_budget() -> u32 {
    2
}
fn default_retry_backoff_base_ms() -> u64 {
    1000
}
fn default_tool_failure_threshold() -> u32 {
    3
}
fn default_max_verification_failures() -> u32 {
    5
}
fn default_verification_retries() -> u32 {
    2
}
fn default_verifier_timeout_secs() -> u64 {
    60
}
fn default_model_timeout_secs() -> u64 {
    300
}
fn default_max_empty_responses() -> u32 {
    3
}
fn default_max_nudges() -> u32 {
    3
}
fn default_context_max_tokens() -> usize {
    32_000
}

impl AgentConfig {
    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_secs(self.verifier_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            guidelines: String::new(),
            parallel_tool_execution: true,
            tool_retry_budget: default_tool_retry_budget(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            tool_failure_threshold: default_tool_failure_threshold(),
            verify_completion: true,
            max_verification_failures: default_max_verification_failures(),
            verification_retries: default_verification_retries(),
            verifier_timeout_secs: default_verifier_timeout_secs(),
            model_timeout_secs: default_model_timeout_secs(),
            max_empty_responses: default_max_empty_responses(),
            max_nudges: default_max_nudges(),
            context_max_tokens: default_context_max_tokens(),
            stream_responses: false,
            approval_required: Vec::new(),
            allowed_tools: Vec::new(),
            deliverable: DeliverableConfig::default(),
        }
    }
}

/// Thresholds for classifying a tool-free answer as a result or a status update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableConfig {
    /// Non-empty answers shorter than this many characters are placeholders
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Answers at least this long are never treated as status updates
    #[serde(default = "default_max_status_length")]
    pub max_status_length: usize,

    /// Additional openers that mark a short answer as a status update
    #[serde(default)]
    pub status_prefixes: Vec<String>,

    /// Additional phrases that mark a short answer as a status update
    /// wherever they appear
    #[serde(default)]
    pub extra_status_phrases: Vec<String>,

    /// Additional exact answers treated as placeholders
    #[serde(default)]
    pub extra_placeholders: Vec<String>,
}

fn default_min_length() -> usize {
    1
}

fn default_max_status_length() -> usize {
    400
}

impl Default for DeliverableConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            max_status_length: default_max_status_length(),
            status_prefixes: Vec::new(),
            extra_status_phrases: Vec::new(),
            extra_placeholders: Vec::new(),
        }
    }
}

/// Progress broadcasting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Coalescing window for routine events
    #[serde(default = "default_throttle_window_ms")]
    pub throttle_window_ms: u64,

    /// Number of recent steps carried by each event
    #[serde(default = "default_max_recent_steps")]
    pub max_recent_steps: usize,

    /// Broadcast channel capacity
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_throttle_window_ms() -> u64 {
    150
}
fn default_max_recent_steps() -> usize {
    20
}
fn default_bus_capacity() -> usize {
    256
}

impl ProgressConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_window_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            throttle_window_ms: default_throttle_window_ms(),
            max_recent_steps: default_max_recent_steps(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

/// Built-in tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Commands the shell tool may run. Empty means any command.
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Root directory file tools are confined to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_allowed_commands() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "grep", "find", "wc", "echo", "pwd", "date", "git", "cargo",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_command_timeout_secs() -> u64 {
    60
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            workspace_root: None,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// Conversation persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory", "file" or "none"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Directory for the file backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "file".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42617
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.agentrail/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `AGENTRAIL_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("AGENTRAIL_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("AGENTRAIL_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("AGENTRAIL_MODEL") {
            self.default_model = model;
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agentrail")
    }

    /// Directory the file store writes conversations to.
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("conversations"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.max_verification_failures == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_verification_failures must be at least 1".into(),
            ));
        }

        if self.agent.tool_failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "agent.tool_failure_threshold must be at least 1".into(),
            ));
        }

        if !matches!(self.store.backend.as_str(), "memory" | "file" | "none") {
            return Err(ConfigError::ValidationError(format!(
                "store.backend must be one of memory, file, none (got '{}')",
                self.store.backend
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Capture the settings a new session runs with.
    pub fn session_snapshot(&self) -> SessionSnapshot {
        let mut snapshot = SessionSnapshot::new(
            self.default_provider.clone(),
            self.default_model.clone(),
            self.agent.max_iterations,
        );
        snapshot.guidelines = self.agent.guidelines.clone();
        snapshot.approval_required = self.agent.approval_required.clone();
        if !self.agent.allowed_tools.is_empty() {
            snapshot.allowed_tools = Some(self.agent.allowed_tools.clone());
        }
        snapshot
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            progress: ProgressConfig::default(),
            tools: ToolsConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
            providers: HashMap::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
