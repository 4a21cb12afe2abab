//! Application configuration

pub mod llm;

use std::env;
use std::fmt;
use std::path::PathBuf;

pub use llm::{ChatSettings, ConfigError, FileConfig, LlmConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub llm: LlmConfig,
    pub chat: ChatSettings,
    pub credential: Credential,
}

impl Config {
    /// Read server settings from the environment, the optional TOML file
    /// named by `CONVERSAI_CONFIG`, and resolve the API key once.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match env::var("CONVERSAI_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                tracing::info!("Loading configuration from {}", path.display());
                FileConfig::from_file(&path)?
            }
            Err(_) => FileConfig::default(),
        };

        let credential = Credential::resolve(&file.llm.api_key_env, |name| env::var(name).ok());

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            llm: file.llm,
            chat: file.chat,
            credential,
        })
    }
}

/// Bearer token for the upstream API
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Outcome of looking up the API key across its sources
#[derive(Debug, Clone)]
pub enum Credential {
    Resolved { key: ApiKey },
    Missing { sources: Vec<String> },
}

impl Credential {
    /// Walk `sources` in order and take the first non-blank value.
    pub fn resolve<F>(sources: &[String], lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for source in sources {
            if let Some(value) = lookup(source) {
                let value = value.trim();
                if !value.is_empty() {
                    tracing::info!("🔑 API key resolved from {}", source);
                    return Credential::Resolved {
                        key: ApiKey::new(value),
                    };
                }
            }
        }

        tracing::warn!("No API key found; turns will fail until one of {:?} is set", sources);
        Credential::Missing {
            sources: sources.to_vec(),
        }
    }

    /// The key, or the error a turn reports when there is none.
    pub fn key(&self) -> Result<&ApiKey, ConfigError> {
        match self {
            Credential::Resolved { key, .. } => Ok(key),
            Credential::Missing { sources } => Err(ConfigError::MissingCredential {
                sources: sources.clone(),
            }),
        }
    }
}
