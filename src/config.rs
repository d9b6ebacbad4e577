//! Application configuration
//!
//! Loaded once at startup from a TOML file. Every section and field has a
//! default, so an empty (or missing) file gives a working local setup:
//!
//! ```toml
//! [backend]
//! kind = "chat"            # or "cli"
//! base_url = "http://localhost:11434"
//! model = "qwen3"
//!
//! [agent]
//! max_iterations = 10
//! max_tool_calls = 15
//!
//! [governor]
//! requests_per_window = 10
//! window_secs = 60
//!
//! [store]
//! path = "/var/lib/hostscope/hostscope.db"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{AgentConfig, OUTPUT_PREVIEW_CHARS};
use crate::llm::chat::ChatBackendConfig;
use crate::llm::cli::CliBackendConfig;
use crate::sandbox::SandboxPolicy;
use crate::security::GovernorConfig;
use crate::store::StoreConfig;
use crate::tools::DEFAULT_MAX_OUTPUT_CHARS;

pub const DEFAULT_CONFIG_PATH: &str = "hostscope.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "io",
            ConfigError::Parse(_) => "parse",
            ConfigError::Invalid(_) => "invalid",
        }
    }
}

/// Which reasoning backend to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Chat(ChatBackendConfig),
    Cli(CliBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Chat(ChatBackendConfig::default())
    }
}

/// `[agent]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Overrides the backend's default model
    pub model: Option<String>,
    pub max_iterations: usize,
    pub max_tool_calls: usize,
    pub system_prompt: Option<String>,
    /// Cap on each tool result sent to the model, in characters
    pub tool_output_chars: usize,
    /// Length of tool output kept in the audit log
    pub output_preview_chars: usize,
    /// Offer the generic `run_command` tool
    pub allow_run_command: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        let agent = AgentConfig::default();
        Self {
            model: agent.model,
            max_iterations: agent.max_iterations,
            max_tool_calls: agent.max_tool_calls,
            system_prompt: agent.system_prompt,
            tool_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            output_preview_chars: OUTPUT_PREVIEW_CHARS,
            allow_run_command: true,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub filter: String,
    pub json: bool,
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317"
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,hostscope=debug".to_string(),
            json: false,
            otlp_endpoint: None,
            service_name: "hostscope".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub agent: AgentSettings,
    pub sandbox: SandboxPolicy,
    pub governor: GovernorConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.agent.max_iterations == 0 {
            return invalid("agent.max_iterations must be at least 1");
        }
        if self.agent.max_tool_calls == 0 {
            return invalid("agent.max_tool_calls must be at least 1");
        }
        if self.agent.tool_output_chars == 0 {
            return invalid("agent.tool_output_chars must be at least 1");
        }
        if self.governor.requests_per_window == 0 || self.governor.window_secs == 0 {
            return invalid("governor.requests_per_window and governor.window_secs must be positive");
        }
        if self.sandbox.timeout_ms == 0 || self.sandbox.max_output_bytes == 0 {
            return invalid("sandbox.timeout_ms and sandbox.max_output_bytes must be positive");
        }
        if self.sandbox.allowed_roots.iter().any(|root| !root.is_absolute()) {
            return invalid("sandbox.allowed_roots must be absolute paths");
        }
        if self.store.conversation_ttl_secs == 0 || self.store.sweep_interval_secs == 0 {
            return invalid("store.conversation_ttl_secs and store.sweep_interval_secs must be positive");
        }
        match &self.backend {
            BackendConfig::Chat(chat) => {
                if !(chat.base_url.starts_with("http://") || chat.base_url.starts_with("https://")) {
                    return invalid("backend.base_url must be an http(s) URL");
                }
            }
            BackendConfig::Cli(cli) => {
                if cli.program.trim().is_empty() {
                    return invalid("backend.program must not be empty");
                }
            }
        }
        Ok(())
    }

    /// Settings for the agent loop
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.agent.model.clone(),
            max_iterations: self.agent.max_iterations,
            max_tool_calls: self.agent.max_tool_calls,
            system_prompt: self.agent.system_prompt.clone(),
            output_preview_chars: self.agent.output_preview_chars,
        }
    }
}
