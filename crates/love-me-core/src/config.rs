//! Configuration management for the love-me daemon.
//!
//! Supports three-layer configuration loading, mirroring the teacher's
//! layering:
//! 1. Built-in defaults.
//! 2. A TOML config file (`<home>/config.toml`).
//! 3. Environment variable overrides (`LOVE_ME_` prefix).

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".love-me")
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    7878
}

fn default_broadcast_queue_depth() -> usize {
    256
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_backoff_ceiling_secs() -> u64 {
    8
}

fn default_step_timeout_secs() -> u64 {
    300
}

/// Gateway (Session Gateway / WebSocket) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind host. Loopback by default — the daemon assumes a local client.
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Per-client broadcast queue depth before slow clients are dropped.
    #[serde(default = "default_broadcast_queue_depth")]
    pub max_broadcast_queue_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            max_broadcast_queue_depth: default_broadcast_queue_depth(),
        }
    }
}

/// Email poller and OAuth credential settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    /// OAuth client id for the upstream mailbox provider.
    #[serde(default)]
    pub client_id: Option<String>,
    /// OAuth client secret.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Long-lived OAuth refresh token, once linked.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Poll cadence in seconds, bounded to [10, 900].
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Exponential backoff ceiling in seconds after provider errors.
    #[serde(default = "default_backoff_ceiling_secs")]
    pub backoff_ceiling_secs: u64,
}

/// LLM vendor settings for the Turn Coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name (e.g. `"anthropic"`, `"openai"`).
    #[serde(default)]
    pub provider: String,
    /// API key for the configured provider.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model identifier.
    #[serde(default)]
    pub model: String,
    /// Path to a base system-prompt file, if any.
    #[serde(default)]
    pub base_prompt_path: Option<String>,
}

/// One external subprocess tool provider declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    /// The provider's registered name.
    pub name: String,
    /// The command to launch.
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Per-step timeout and retry defaults for the workflow executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default per-step wall-clock timeout in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Directory under which all persisted state lives.
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    /// WebSocket gateway settings.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Email polling and OAuth settings.
    #[serde(default)]
    pub email: EmailConfig,
    /// LLM vendor settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Executor defaults.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// External subprocess tool providers to launch at startup.
    #[serde(default)]
    pub tool_providers: Vec<ToolProviderConfig>,
}

impl Config {
    /// Load layered configuration: defaults, then an optional TOML file at
    /// `<home>/config.toml`, then `LOVE_ME_*` environment overrides.
    ///
    /// A missing config file is not an error — defaults apply and the
    /// caller may persist them with `save`.
    pub fn load(home_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let home = home_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(default_home_dir);
        let path = home.join("config.toml");

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::WriteError { source })?;
            toml::from_str::<Config>(&contents).map_err(|source| ConfigError::ParseError { source })?
        } else {
            Config::default()
        };
        config.home_dir = home;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `LOVE_ME_*` environment variable overrides on top of the
    /// file/default layer. Only the handful of values an operator commonly
    /// needs to flip without editing the file are covered.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("LOVE_ME_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Ok(port) = env::var("LOVE_ME_GATEWAY_PORT") {
            if let Ok(parsed) = port.parse() {
                self.gateway.port = parsed;
            }
        }
        if let Ok(secs) = env::var("LOVE_ME_EMAIL_POLL_INTERVAL_SECS") {
            if let Ok(parsed) = secs.parse() {
                self.email.poll_interval_secs = parsed;
            }
        }
        if let Ok(key) = env::var("LOVE_ME_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
    }

    /// Reject out-of-bounds values per §4.7.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(10..=900).contains(&self.email.poll_interval_secs) {
            return Err(ConfigError::InvalidValue {
                field: "email.poll_interval_secs".to_string(),
                message: "must be between 10 and 900 seconds".to_string(),
            });
        }
        if !self.home_dir.is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "home_dir".to_string(),
                message: "must be an absolute path".to_string(),
            });
        }
        Ok(())
    }

    /// Write this config back to `<home>/config.toml` as a starting point
    /// for the operator to edit.
    pub fn save(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.home_dir).map_err(|source| ConfigError::WriteError { source })?;
        let rendered = toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidValue {
            field: "<config>".to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(self.home_dir.join("config.toml"), rendered)
            .map_err(|source| ConfigError::WriteError { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut config = Config::default();
        config.home_dir = PathBuf::from("/tmp/love-me-test-home");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_poll_interval_out_of_bounds() {
        let mut config = Config::default();
        config.home_dir = PathBuf::from("/tmp/love-me-test-home");
        config.email.poll_interval_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_home_dir() {
        let mut config = Config::default();
        config.home_dir = PathBuf::from("relative/path");
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(dir.path())).unwrap();
        assert_eq!(config.gateway.port, default_gateway_port());
        assert_eq!(config.home_dir, dir.path());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.home_dir = dir.path().to_path_buf();
        config.gateway.port = 9999;
        config.save().unwrap();

        let loaded = Config::load(Some(dir.path())).unwrap();
        assert_eq!(loaded.gateway.port, 9999);
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.home_dir = dir.path().to_path_buf();
        config.gateway.port = 1111;
        config.save().unwrap();

        env::set_var("LOVE_ME_GATEWAY_PORT", "2222");
        let loaded = Config::load(Some(dir.path())).unwrap();
        env::remove_var("LOVE_ME_GATEWAY_PORT");
        assert_eq!(loaded.gateway.port, 2222);
    }
}
