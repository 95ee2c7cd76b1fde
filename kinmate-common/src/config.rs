//! Configuration loading
//!
//! Settings sources, highest priority first:
//! 1. Command-line arguments (`--bind`, `--store-url`)
//! 2. Environment variables
//! 3. TOML configuration file (`--config`, else `~/.config/kinmate/config.toml`)
//! 4. Built-in defaults
//!
//! A missing config file is not an error; a malformed one is.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Chat-completions endpoint used by the assistant and summarizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,
    /// Model name sent with every request
    pub model: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Companion service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Rounds per summarization chunk (K)
    pub summary_chunk_size: usize,
    /// Idle time after which a session is finalized
    pub idle_timeout_secs: u64,
    /// Watchdog polling interval
    pub watchdog_poll_secs: u64,
    /// User id for requests that do not name one (single-session mode)
    pub default_user_id: String,
    /// `memory://` or `sqlite://<path>`
    pub store_url: String,
    /// TTL of request claims and session keys
    pub request_ttl_secs: u64,
    /// Width of the time bucket folded into derived request ids
    pub dedup_window_ms: u64,
    /// Prior unsummarized rounds handed to the assistant as context
    pub context_turns: usize,
    /// Stream receiving risk alerts
    pub alert_stream_key: String,
    /// Classifier reasons containing any of these raise a high-severity alert
    pub self_harm_keywords: Vec<String>,
    /// Delete session keys after the finalizer has flushed the summary
    ///
    /// The stored summary text goes with them. The flushed text is then only
    /// available from the `SessionFinalized` event and the close response, so
    /// the next session's assistant context starts without it. Disable to
    /// keep history and summary until their TTL expires.
    pub purge_on_finalize: bool,
    /// HTTP listen address
    pub bind_addr: String,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            summary_chunk_size: 5,
            idle_timeout_secs: 300,
            watchdog_poll_secs: 5,
            default_user_id: "test_user".to_string(),
            store_url: "memory://".to_string(),
            request_ttl_secs: 86_400,
            dedup_window_ms: 3_000,
            context_turns: 6,
            alert_stream_key: "alerts:stream".to_string(),
            self_harm_keywords: ["自殺", "跳樓", "割腕", "suicide", "self-harm", "kill myself"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            purge_on_finalize: true,
            bind_addr: "127.0.0.1:5731".to_string(),
            llm: LlmConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub bind_addr: Option<String>,
    pub store_url: Option<String>,
}

impl ServiceConfig {
    /// Parse a TOML document; absent fields keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))
    }

    /// Load a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply environment overrides read through `lookup`
    ///
    /// Unparseable numeric values are reported as configuration errors
    /// rather than silently ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{} is not a valid number: {:?}", name, raw)))
        }

        if let Some(v) = lookup("SUMMARY_CHUNK_SIZE") {
            self.summary_chunk_size = parse("SUMMARY_CHUNK_SIZE", v)?;
        }
        if let Some(v) = lookup("KINMATE_IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = parse("KINMATE_IDLE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("KINMATE_WATCHDOG_POLL_SECS") {
            self.watchdog_poll_secs = parse("KINMATE_WATCHDOG_POLL_SECS", v)?;
        }
        if let Some(v) = lookup("KINMATE_REQUEST_TTL_SECS") {
            self.request_ttl_secs = parse("KINMATE_REQUEST_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("KINMATE_DEDUP_WINDOW_MS") {
            self.dedup_window_ms = parse("KINMATE_DEDUP_WINDOW_MS", v)?;
        }
        if let Some(v) = lookup("TEST_USER_ID") {
            self.default_user_id = v;
        }
        if let Some(v) = lookup("KINMATE_STORE_URL") {
            self.store_url = v;
        }
        if let Some(v) = lookup("ALERT_STREAM_KEY") {
            self.alert_stream_key = v;
        }
        if let Some(v) = lookup("KINMATE_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("KINMATE_LLM_ENDPOINT") {
            self.llm.endpoint = v;
        }
        if let Some(v) = lookup("KINMATE_LLM_MODEL") {
            self.llm.model = v;
        }
        Ok(())
    }

    /// Reject settings the coordination layer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.summary_chunk_size == 0 {
            return Err(Error::Config("summary_chunk_size must be at least 1".to_string()));
        }
        if self.watchdog_poll_secs == 0 {
            return Err(Error::Config("watchdog_poll_secs must be at least 1".to_string()));
        }
        if self.idle_timeout_secs < self.watchdog_poll_secs {
            return Err(Error::Config(format!(
                "idle_timeout_secs ({}) must not be shorter than watchdog_poll_secs ({})",
                self.idle_timeout_secs, self.watchdog_poll_secs
            )));
        }
        if self.default_user_id.trim().is_empty() {
            return Err(Error::Config("default_user_id must not be empty".to_string()));
        }
        if self.dedup_window_ms == 0 {
            return Err(Error::Config("dedup_window_ms must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Resolve the effective configuration from every source
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = match overrides.config_path.clone().or_else(default_config_path) {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            Some(path) => {
                if overrides.config_path.is_some() {
                    warn!("Config file {} not found, using defaults", path.display());
                }
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_with(|name| std::env::var(name).ok())?;

        if let Some(bind) = &overrides.bind_addr {
            config.bind_addr = bind.clone();
        }
        if let Some(url) = &overrides.store_url {
            config.store_url = url.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn watchdog_poll(&self) -> Duration {
        Duration::from_secs(self.watchdog_poll_secs)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_secs(self.request_ttl_secs)
    }
}

/// Platform config file location (`<config dir>/kinmate/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kinmate").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert_eq!(config.summary_chunk_size, 5);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.watchdog_poll(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SUMMARY_CHUNK_SIZE", "3"),
            ("TEST_USER_ID", "grandpa"),
            ("KINMATE_STORE_URL", "sqlite:///tmp/kinmate.db"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config
            .apply_env_with(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.summary_chunk_size, 3);
        assert_eq!(config.default_user_id, "grandpa");
        assert_eq!(config.store_url, "sqlite:///tmp/kinmate.db");
        assert_eq!(config.idle_timeout_secs, 300);
    }

    #[test]
    fn test_env_rejects_non_numeric() {
        let mut config = ServiceConfig::default();
        let result = config.apply_env_with(|name| {
            (name == "SUMMARY_CHUNK_SIZE").then(|| "five".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = ServiceConfig {
            summary_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_timeout_shorter_than_poll() {
        let config = ServiceConfig {
            idle_timeout_secs: 2,
            watchdog_poll_secs: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
