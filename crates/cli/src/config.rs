use proto::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_MAX_TOOL_ROUNDS: usize = 25;

fn default_max_tool_rounds() -> usize {
    DEFAULT_MAX_TOOL_ROUNDS
}

fn default_max_upload_bytes() -> u64 {
    agent::DEFAULT_MAX_UPLOAD_BYTES
}

/// Data directory (`~/.productstudio`).
pub fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".productstudio")
}

/// Top-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Reasoning engine settings.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Remote media-generation service.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Upload interception limits.
    #[serde(default)]
    pub uploads: UploadsConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Agent model/provider config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model ID. Leave empty (or omit) to use the default.
    #[serde(default)]
    pub model: String,
    /// API key (env overrides applied at load time; see `Config::load`).
    #[serde(default)]
    pub api_key: String,
    /// OpenAI-compatible base URL. Uses the public endpoint when unset.
    pub base_url: Option<String>,
    /// Maximum tool-call rounds per turn before bailing out.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            api_key: String::new(),
            base_url: None,
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

impl AgentConfig {
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &self.model
        }
    }

    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url.as_deref().filter(|url| !url.is_empty())
    }
}

/// Media-generation service config. Without an endpoint only the local
/// transforms are available.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
}

impl BackendConfig {
    pub fn endpoint(&self) -> Option<&str> {
        let trimmed = self.endpoint.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn api_key(&self) -> Option<String> {
        (!self.api_key.is_empty()).then(|| self.api_key.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Per-item size limit in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_bytes: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_upload_bytes(),
        }
    }
}

/// Database storage config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path.
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: data_dir().join("studio.db").to_string_lossy().into_owned(),
        }
    }
}

impl Config {
    /// Loads configuration from explicit path, fallback locations, and env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            // Look in current dir, then the data dir
            let cwd = std::env::current_dir().ok()?.join("config.toml");
            if cwd.exists() {
                return Some(cwd);
            }
            let home_config = data_dir().join("config.toml");
            home_config.exists().then_some(home_config)
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = match config_path {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
                Self::from_toml_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;

        debug!(
            model = %config.agent.effective_model(),
            base_url = ?config.agent.effective_base_url(),
            backend = ?config.backend.endpoint(),
            max_upload_bytes = config.uploads.max_bytes,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(key) = std::env::var("STUDIO_API_KEY") {
            self.agent.api_key = key;
        }
        if let Ok(model) = std::env::var("STUDIO_MODEL") {
            self.agent.model = model;
        }
        if let Ok(url) = std::env::var("STUDIO_BASE_URL") {
            self.agent.base_url = Some(url);
        }
        if let Ok(url) = std::env::var("STUDIO_BACKEND_URL") {
            self.backend.endpoint = url;
        }
        if let Ok(key) = std::env::var("STUDIO_BACKEND_KEY") {
            self.backend.api_key = key;
        }
        if let Ok(raw) = std::env::var("STUDIO_MAX_UPLOAD_BYTES") {
            self.uploads.max_bytes = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "STUDIO_MAX_UPLOAD_BYTES".to_string(),
                reason: format!("'{raw}' is not a byte count"),
            })?;
        }
        if let Ok(db) = std::env::var("STUDIO_DB") {
            self.database.url = db;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "agent.max_tool_rounds".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.uploads.max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "uploads.max_bytes".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(endpoint) = self.backend.endpoint()
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(ConfigError::InvalidValue {
                field: "backend.endpoint".to_string(),
                reason: format!("'{endpoint}' is not an http(s) URL"),
            });
        }
        Ok(())
    }

    /// Resolves the reasoning-engine API key.
    ///
    /// Priority: `agent.api_key` (or `STUDIO_API_KEY`), then `OPENAI_API_KEY`.
    pub fn resolve_api_key(&self) -> String {
        if !self.agent.api_key.is_empty() {
            debug!(source = "config", "API key resolved");
            return self.agent.api_key.clone();
        }
        let fallback = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if fallback.is_empty() {
            debug!("No API key found from any source");
        } else {
            debug!(source = "env", "API key resolved from OPENAI_API_KEY");
        }
        fallback
    }
}
