//! Configuration models for switchboard.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The operator resolves these unknowns at startup via config file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Top-level configuration for switchboard.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP boundary settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Health probing settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Configured providers, keyed by unique name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// HTTP boundary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Maximum number of messages accepted per chat request
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Maximum characters per message
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,

    /// Per-client request ceiling per minute (0 disables)
    #[serde(default = "default_client_rpm")]
    pub client_requests_per_minute: u32,

    /// System prompt that replaces any client-supplied system messages
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Answer CORS preflights for any origin
    #[serde(default = "default_true")]
    pub cors: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_messages() -> usize {
    100
}

fn default_max_message_chars() -> usize {
    10_000
}

fn default_client_rpm() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_messages: default_max_messages(),
            max_message_chars: default_max_message_chars(),
            client_requests_per_minute: default_client_rpm(),
            system_prompt: None,
            cors: default_true(),
        }
    }
}

/// Health probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Upper bound for a single probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Background refresh interval (0 disables the background task)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Age after which a probe result is ignored (default: twice the
    /// refresh interval, or 600 when refresh is disabled)
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_refresh_interval() -> u64 {
    300
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            refresh_interval_secs: default_refresh_interval(),
            stale_after_secs: None,
        }
    }
}

impl HealthConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Background refresh interval, `None` when disabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    /// Maximum age of a probe result before routing treats it as unknown.
    pub fn stale_after(&self) -> Duration {
        let secs = match (self.stale_after_secs, self.refresh_interval_secs) {
            (Some(secs), _) => secs,
            (None, 0) => 2 * default_refresh_interval(),
            (None, refresh) => refresh.saturating_mul(2),
        };
        Duration::from_secs(secs)
    }
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions (Groq, OpenRouter, vLLM, Ollama)
    #[default]
    Openai,
    /// Google Gemini `generateContent`
    Gemini,
}

impl ProviderKind {
    /// Base URL used when none is configured.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Openai => None,
            ProviderKind::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
        }
    }

    /// Whether the protocol cannot work without a credential.
    pub fn requires_api_key(&self) -> bool {
        matches!(self, ProviderKind::Gemini)
    }
}

/// Configuration for one provider.
///
/// K_i: `priority` orders fallback; ties break by provider name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Wire protocol
    #[serde(default)]
    pub kind: ProviderKind,

    /// Fallback order (lower = tried first)
    pub priority: u32,

    /// Model identifier (e.g. "llama-3.1-8b-instant", "gemini-1.5-flash")
    pub model: String,

    /// Base URL for the API (required for `openai` kind)
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key (supports ${ENV_VAR} expansion)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Custom headers to include in requests
    /// Values can contain ${ENV_VAR} for environment variable expansion
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Dispatch timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum completion tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Per-minute request ceiling (absent = unlimited, 0 = disabled)
    #[serde(default)]
    pub requests_per_minute: Option<u32>,

    /// Per-day request ceiling (absent = unlimited, 0 = disabled)
    #[serde(default)]
    pub requests_per_day: Option<u32>,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f64 {
    0.7
}

impl ProviderConfig {
    /// Minimal provider entry; remaining fields take their defaults.
    pub fn new(kind: ProviderKind, priority: u32, model: impl Into<String>) -> Self {
        Self {
            kind,
            priority,
            model: model.into(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            requests_per_minute: None,
            requests_per_day: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base URL with any trailing slash removed.
    pub fn resolve_base_url(&self, name: &str) -> Result<String, ConfigError> {
        self.base_url
            .as_deref()
            .map(expand_env_vars)
            .or_else(|| self.kind.default_base_url().map(str::to_string))
            .filter(|url| !url.trim().is_empty())
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| ConfigError::MissingEndpoint(name.to_string()))
    }

    /// Resolve API key from config or environment.
    ///
    /// B_i(api key available) → Result
    /// Returns `Ok(None)` for keyless endpoints (local vLLM/Ollama).
    pub fn resolve_api_key(&self, name: &str) -> Result<Option<String>, ConfigError> {
        // First check explicit api_key in config
        if let Some(key) = &self.api_key {
            let key = expand_env_vars(key);
            if !key.is_empty() && !key.contains("${") {
                return Ok(Some(key));
            }
        }

        // Then check environment variable
        if let Some(env_var) = &self.api_key_env {
            return match std::env::var(env_var) {
                Ok(key) if !key.is_empty() => Ok(Some(key)),
                _ => Err(ConfigError::MissingApiKey {
                    provider: name.to_string(),
                    env_var: env_var.clone(),
                }),
            };
        }

        if self.api_key.is_some() || self.kind.requires_api_key() {
            return Err(ConfigError::MissingApiKey {
                provider: name.to_string(),
                env_var: format!("{}_API_KEY", name.to_uppercase()),
            });
        }

        // No API key configured (valid for local endpoints)
        Ok(None)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Provider names ordered by ascending `(priority, name)`.
    pub fn provider_order(&self) -> Vec<&str> {
        let mut names: Vec<(&str, u32)> = self
            .providers
            .iter()
            .map(|(name, p)| (name.as_str(), p.priority))
            .collect();
        names.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        names.into_iter().map(|(name, _)| name).collect()
    }

    /// Structural validation. Credential and endpoint resolution happens
    /// per provider in the registry so one bad provider cannot take down
    /// the rest.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        for (name, provider) in &self.providers {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidProvider {
                    provider: name.clone(),
                    reason: "provider name must not be empty".to_string(),
                });
            }
            if provider.model.trim().is_empty() {
                return Err(ConfigError::InvalidProvider {
                    provider: name.clone(),
                    reason: "model must not be empty".to_string(),
                });
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigError::InvalidProvider {
                    provider: name.clone(),
                    reason: "timeout_secs must be greater than zero".to_string(),
                });
            }
        }

        if self.server.max_messages == 0 {
            return Err(ConfigError::InvalidServer(
                "max_messages must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR_RE.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Expand environment variables in all headers.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env_vars(v)))
        .collect()
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(
        "Missing API key for provider '{provider}': set {env_var} env var or api_key in config"
    )]
    MissingApiKey { provider: String, env_var: String },

    #[error("Missing base_url for provider '{0}'")]
    MissingEndpoint(String),

    #[error("Invalid provider '{provider}': {reason}")]
    InvalidProvider { provider: String, reason: String },

    #[error("Invalid server config: {0}")]
    InvalidServer(String),

    #[error("No providers configured (add at least one [providers.<name>] table)")]
    NoProviders,

    #[error("No usable providers: every configured provider is missing a credential or endpoint")]
    NoUsableProviders,
}
