//! File-based configuration loaded from TOML
//!
//! Every section is optional; a missing file or an empty table falls back to
//! the Perplexity defaults.
//!
//! ```toml
//! [llm]
//! endpoint = "https://api.perplexity.ai/chat/completions"
//! model = "llama-3.1-sonar-small-128k-chat"
//! system_prompt = "You are a helpful AI assistant."
//! api_key_env = ["REACT_APP_PERPLEXITY_API_KEY", "PERPLEXITY_API_KEY"]
//! max_line_bytes = 1048576
//!
//! [chat]
//! greeting = "Hi! I am your AI assistant. Ask me anything."
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::stream::DEFAULT_MAX_LINE_BYTES;

/// Root of the TOML configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    /// Upstream chat API settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Transcript settings
    #[serde(default)]
    pub chat: ChatSettings,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let llm = &self.llm;
        if llm.endpoint.trim().is_empty() {
            return Err(ConfigError::Validation("llm.endpoint must not be empty".into()));
        }
        if llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model must not be empty".into()));
        }
        if llm.api_key_env.iter().all(|name| name.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "llm.api_key_env must name at least one variable".into(),
            ));
        }
        if llm.max_line_bytes == 0 {
            return Err(ConfigError::Validation(
                "llm.max_line_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Upstream chat-completions settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Full URL of the chat-completions endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Model to request
    #[serde(default = "default_model")]
    pub model: String,

    /// System message sent ahead of every prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Environment variables holding the API key, highest priority first
    #[serde(default = "default_api_key_env")]
    pub api_key_env: Vec<String>,

    /// Upper bound on a partial event line held between chunks
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Connection setup timeout. Reading the stream itself is unbounded.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.perplexity.ai/chat/completions".to_string()
}

fn default_model() -> String {
    "llama-3.1-sonar-small-128k-chat".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant.".to_string()
}

fn default_api_key_env() -> Vec<String> {
    vec![
        "REACT_APP_PERPLEXITY_API_KEY".to_string(),
        // Mis-prefixed name found in older .env files
        "REACT_APP_REACT_APP_PERPLEXITY_API_KEY".to_string(),
        "PERPLEXITY_API_KEY".to_string(),
    ]
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            api_key_env: default_api_key_env(),
            max_line_bytes: default_max_line_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Transcript settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Assistant message shown before the first turn. Empty disables it.
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_greeting() -> String {
    "Hi! I am your AI assistant. Ask me anything.".to_string()
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
        }
    }
}

impl ChatSettings {
    pub fn greeting(&self) -> Option<&str> {
        Some(self.greeting.trim()).filter(|g| !g.is_empty())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(
        "Missing API key. Please set one of the following in your environment or .env (and restart): {}",
        .sources.join(", ")
    )]
    MissingCredential { sources: Vec<String> },
}
