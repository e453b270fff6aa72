//! Configuration management for the Ollama relay.
//!
//! The relay reads a single configuration file at `~/.ollama-relay/config.json`
//! (or the path in `RELAY_CONFIG`).
//!
//! # Configuration Priority
//!
//! 1. Environment variables (applied by `load_with_env`)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `DISCORD_BOT_TOKEN` → channels.discord.bot_token
//! - `DISCORD_APPLICATION_ID` → channels.discord.application_id
//! - `OLLAMA_HOST` → llm.ollama.base_url
//! - `RELAY_DEFAULT_MODEL` → llm.ollama.default_model
//! - `RELAY_MAX_CHUNK_SIZE` → streaming.max_chunk_size
//! - `RELAY_FLUSH_INTERVAL_MS` → streaming.flush_interval_ms
//! - `RELAY_CONCURRENT_REQUEST_POLICY` → streaming.concurrent_request_policy
//! - `RELAY_MAX_HISTORY_ENTRIES` → session.max_history_entries
//! - `RELAY_LOG_LEVEL` → observability.log_level
//! - `RELAY_LOG_FORMAT` → observability.log_format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".ollama-relay"),
        |dirs| dirs.home_dir().join(".ollama-relay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// LLM Configuration
// ============================================================================

/// Inference backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Ollama (local models) configuration
    #[serde(default)]
    pub ollama: OllamaConfig,
}

/// Ollama connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Ollama API base URL
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    /// Model used for users who never switched models
    #[serde(default = "default_ollama_model")]
    pub default_model: String,

    /// Replace `default_model` with the first installed model when it is not installed
    #[serde(default = "default_true")]
    pub auto_select_model: bool,

    /// Request timeout in seconds (local models can be slow)
    #[serde(default = "default_ollama_timeout")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            default_model: default_ollama_model(),
            auto_select_model: true,
            timeout_secs: default_ollama_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".into()
}

fn default_ollama_model() -> String {
    "llama3".into()
}

fn default_ollama_timeout() -> u64 {
    300 // 5 minutes, local models can be slow
}

fn default_connect_timeout() -> u64 {
    10
}

// ============================================================================
// Streaming / Session Configuration
// ============================================================================

/// What to do when a user asks for a new generation while one is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrentRequestPolicy {
    /// Cancel the running generation, then start the new one.
    #[default]
    Preempt,
    /// Refuse the new request with a busy error.
    Reject,
}

impl std::str::FromStr for ConcurrentRequestPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "preempt" => Ok(Self::Preempt),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown concurrent request policy: {other}")),
        }
    }
}

/// Streaming delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Maximum characters per output message
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Minimum time between two edits of the visible response, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Maximum wait for the next delta before the stream counts as failed
    #[serde(default = "default_delta_timeout_secs")]
    pub delta_timeout_secs: u64,

    /// Behaviour when a user starts a generation while one is running
    #[serde(default)]
    pub concurrent_request_policy: ConcurrentRequestPolicy,

    /// Prefix the response with a model/prompt header
    #[serde(default = "default_true")]
    pub show_header: bool,
}

impl StreamingConfig {
    /// Flush interval as a `Duration`.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Per-delta timeout as a `Duration`.
    pub fn delta_timeout(&self) -> Duration {
        Duration::from_secs(self.delta_timeout_secs)
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            flush_interval_ms: default_flush_interval_ms(),
            delta_timeout_secs: default_delta_timeout_secs(),
            concurrent_request_policy: ConcurrentRequestPolicy::default(),
            show_header: true,
        }
    }
}

fn default_max_chunk_size() -> usize {
    1900
}

fn default_flush_interval_ms() -> u64 {
    1500
}

fn default_delta_timeout_secs() -> u64 {
    120
}

/// Conversation state settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// History entry ceiling per user; oldest turns are dropped first
    #[serde(default = "default_max_history_entries")]
    pub max_history_entries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_history_entries: default_max_history_entries(),
        }
    }
}

fn default_max_history_entries() -> usize {
    10
}

// ============================================================================
// Channels Configuration
// ============================================================================

/// Chat surfaces the relay listens on.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    /// Discord bot configuration
    #[serde(default)]
    pub discord: Option<DiscordConfig>,

    /// CLI channel configuration
    #[serde(default)]
    pub cli: Option<CliChannelConfig>,
}

/// Discord channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub application_id: String,
    /// User IDs allowed to talk to the bot, `*` for everyone
    #[serde(default = "default_allowed_users")]
    pub allowed_users: Vec<String>,
    /// Only the requesting user sees responses
    #[serde(default = "default_true")]
    pub ephemeral: bool,
    /// Overwrite the global slash command set on startup
    #[serde(default = "default_true")]
    pub register_commands: bool,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            application_id: String::new(),
            allowed_users: default_allowed_users(),
            ephemeral: true,
            register_commands: true,
        }
    }
}

fn default_allowed_users() -> Vec<String> {
    vec!["*".into()]
}

/// CLI channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliChannelConfig {
    pub enabled: bool,
    /// Identity used for the terminal user's session
    #[serde(default = "default_cli_user")]
    pub user_id: String,
}

fn default_cli_user() -> String {
    "cli-user".into()
}

// ============================================================================
// Activity Log / Observability
// ============================================================================

/// Per-interaction activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for `user_activity.jsonl` (default: `~/.ollama-relay/logs`)
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl ActivityLogConfig {
    /// Resolved log directory.
    pub fn dir(&self) -> PathBuf {
        self.log_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir().join("logs"))
    }
}

impl Default for ActivityLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            max_output_chars: default_max_output_chars(),
            max_file_bytes: default_max_file_bytes(),
            max_backups: default_max_backups(),
        }
    }
}

fn default_max_output_chars() -> usize {
    5000
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_backups() -> usize {
    5
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets forced to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Inference backend
    #[serde(default)]
    pub llm: LlmConfig,

    /// Streaming delivery
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Conversation state
    #[serde(default)]
    pub session: SessionConfig,

    /// Chat surfaces
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// User activity log
    #[serde(default)]
    pub activity_log: ActivityLogConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("DISCORD_BOT_TOKEN") {
            let discord = self.channels.discord.get_or_insert_with(|| DiscordConfig {
                enabled: true,
                ..Default::default()
            });
            discord.bot_token = token;
        }
        if let Some(app_id) = lookup("DISCORD_APPLICATION_ID") {
            if let Some(ref mut discord) = self.channels.discord {
                discord.application_id = app_id;
            }
        }

        if let Some(host) = lookup("OLLAMA_HOST") {
            self.llm.ollama.base_url = host;
        }
        if let Some(model) = lookup("RELAY_DEFAULT_MODEL") {
            self.llm.ollama.default_model = model;
        }

        if let Some(size) = lookup("RELAY_MAX_CHUNK_SIZE") {
            if let Ok(s) = size.parse() {
                self.streaming.max_chunk_size = s;
            }
        }
        if let Some(ms) = lookup("RELAY_FLUSH_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                self.streaming.flush_interval_ms = ms;
            }
        }
        if let Some(policy) = lookup("RELAY_CONCURRENT_REQUEST_POLICY") {
            match policy.parse() {
                Ok(p) => self.streaming.concurrent_request_policy = p,
                Err(e) => tracing::warn!(error = %e, "Ignoring RELAY_CONCURRENT_REQUEST_POLICY"),
            }
        }
        if let Some(max) = lookup("RELAY_MAX_HISTORY_ENTRIES") {
            if let Ok(m) = max.parse() {
                self.session.max_history_entries = m;
            }
        }

        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("RELAY_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Whether the Discord channel should start.
    pub fn discord_enabled(&self) -> bool {
        self.channels.discord.as_ref().is_some_and(|d| d.enabled)
    }

    /// Whether the CLI channel should start.
    pub fn cli_enabled(&self) -> bool {
        self.channels.cli.as_ref().is_some_and(|c| c.enabled)
    }
}
