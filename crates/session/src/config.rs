//! Session configuration.
//!
//! Resolved once at startup (TOML file, then `.env` and process environment
//! overrides), validated in one place, and handed to the session and client
//! as an immutable value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:3000/api/chat";
pub const INGEST_PATH: &str = "/api/retrieval/ingest";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub agent: AgentConfig,
    pub pacing: PacingConfig,
    pub session: SessionSettings,
    pub logging: LoggingConfig,
}

/// Where the agent lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Chat endpoint, e.g. `http://localhost:3000/api/chat`.
    pub endpoint: String,
    /// Document ingestion endpoint. Defaults to `/api/retrieval/ingest` on
    /// the chat endpoint's origin.
    pub ingest_endpoint: Option<String>,
    /// Applies to structured replies and ingestion. Streams are only bounded
    /// by the connect timeout.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Delay between revealed intermediate steps, drawn from `[min_ms, max_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Initial state of the "show intermediate steps" toggle.
    pub reveal_steps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Optional JSONL file receiving one record per turn.
    pub turn_log: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            ingest_endpoint: None,
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_ms: 1000,
            max_ms: 2000,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { reveal_steps: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            turn_log: None,
        }
    }
}

impl PacingConfig {
    /// Draw one reveal delay uniformly from `[min_ms, max_ms)`.
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..self.max_ms))
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// The explicit ingest endpoint, or the ingest path on the chat origin.
    pub fn resolved_ingest_endpoint(&self) -> Result<String, ConfigError> {
        if let Some(explicit) = &self.ingest_endpoint {
            return Ok(explicit.clone());
        }
        let mut url = parse_url("agent.endpoint", &self.endpoint)?;
        url.set_path(INGEST_PATH);
        url.set_query(None);
        Ok(url.to_string())
    }
}

impl ChatConfig {
    /// Defaults plus overrides from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// File (if given), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!("Failed to load .env file: {}", e);
            }
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENTCHAT_*` / `LOG_LEVEL` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = lookup("AGENTCHAT_ENDPOINT") {
            self.agent.endpoint = endpoint;
        }
        if let Some(ingest) = lookup("AGENTCHAT_INGEST_ENDPOINT") {
            self.agent.ingest_endpoint = Some(ingest);
        }
        if let Some(timeout) = lookup("AGENTCHAT_REQUEST_TIMEOUT_SECS") {
            self.agent.request_timeout_secs = parse_number("AGENTCHAT_REQUEST_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(min) = lookup("AGENTCHAT_PACING_MIN_MS") {
            self.pacing.min_ms = parse_number("AGENTCHAT_PACING_MIN_MS", &min)?;
        }
        if let Some(max) = lookup("AGENTCHAT_PACING_MAX_MS") {
            self.pacing.max_ms = parse_number("AGENTCHAT_PACING_MAX_MS", &max)?;
        }
        if let Some(reveal) = lookup("AGENTCHAT_REVEAL_STEPS") {
            self.session.reveal_steps = parse_bool("AGENTCHAT_REVEAL_STEPS", &reveal)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(path) = lookup("AGENTCHAT_TURN_LOG") {
            self.logging.turn_log = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "agent.endpoint".to_string(),
            });
        }
        parse_url("agent.endpoint", &self.agent.endpoint)?;
        if let Some(ingest) = &self.agent.ingest_endpoint {
            parse_url("agent.ingest_endpoint", ingest)?;
        }

        if self.agent.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "agent.request_timeout_secs".to_string(),
                reason: "Timeout must be > 0".to_string(),
            });
        }

        if self.pacing.min_ms >= self.pacing.max_ms {
            return Err(ConfigError::InvalidValue {
                key: "pacing".to_string(),
                reason: format!(
                    "min_ms ({}) must be below max_ms ({})",
                    self.pacing.min_ms, self.pacing.max_ms
                ),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("Must be one of: {}", valid_levels.join(", ")),
            });
        }

        Ok(())
    }
}

fn parse_url(key: &str, raw: &str) -> Result<url::Url, ConfigError> {
    let url = url::Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{}' is not an absolute URL: {}", raw, e),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{}' is not a non-negative integer", raw),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("'{}' is not a boolean", raw),
        }),
    }
}
