//! Configuration loading from rigging.toml.

use std::path::{Path, PathBuf};

use mcp::ConnectOptions;
use runtime::OrchestratorConfig;
use runtime::providers::{DEFAULT_HOST, DEFAULT_MODEL};
use serde::Deserialize;
use storage::UserId;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub chat: ChatConfig,
    pub storage: StorageConfig,

    /// Identity conversations and tools are stored under. When unset, an id
    /// is generated once and kept in the data directory.
    pub user_id: Option<UserId>,

    /// Tool servers to connect when a chat starts.
    pub mcp: ConnectOptions,
}

/// Inference backend configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Ollama base URL.
    pub host: String,

    /// Model used unless a request names another.
    pub model: String,

    /// Ask the model to run its reasoning phase.
    pub think: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            model: DEFAULT_MODEL.to_string(),
            think: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub max_tool_rounds: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: OrchestratorConfig::default().max_tool_rounds,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file; defaults to `rigging.db` in the data directory.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `OLLAMA_HOST` and `RIGGING_MODEL` from the environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("OLLAMA_HOST").filter(|v| !v.is_empty()) {
            self.backend.host = host;
        }
        if let Some(model) = lookup("RIGGING_MODEL").filter(|v| !v.is_empty()) {
            self.backend.model = model;
        }
        self
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_model: self.backend.model.clone(),
            think: self.backend.think,
            max_tool_rounds: self.chat.max_tool_rounds,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chat.max_tool_rounds == 0 {
            return Err(ConfigError::Invalid(
                "chat.max_tool_rounds must be at least 1".into(),
            ));
        }
        if self.backend.model.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.model must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
