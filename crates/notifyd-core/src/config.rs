//! notifyd configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NotifydError, Result};

/// Environment variable that overrides `[sender] token`.
pub const SENDER_TOKEN_ENV: &str = "NOTIFYD_SENDER_TOKEN";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifydConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl NotifydConfig {
    /// Load config from the default path (~/.notifyd/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NotifydError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| NotifydError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the notifyd home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".notifyd")
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(SENDER_TOKEN_ENV) {
            if !token.is_empty() {
                self.sender.token = token;
            }
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra origin allowed by CORS (besides localhost).
    #[serde(default)]
    pub client_origin: String,
}

fn default_port() -> u16 { 8000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            client_origin: String::new(),
        }
    }
}

/// SQLite database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.notifyd/notifyd.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn expanded_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// External sending service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Base URL; the message id is appended as the last path segment.
    #[serde(default = "default_sender_url")]
    pub url: String,
    /// Value of the Authorization header.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_sender_timeout")]
    pub timeout_secs: u64,
}

fn default_sender_url() -> String { "http://localhost:8080/v1/send".into() }
fn default_sender_timeout() -> u64 { 10 }

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            url: default_sender_url(),
            token: String::new(),
            timeout_secs: default_sender_timeout(),
        }
    }
}

impl SenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Queue capacities and timing of the send pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_messages_queue")]
    pub messages_queue: usize,
    #[serde(default = "default_responses_queue")]
    pub responses_queue: usize,
    #[serde(default = "default_notifications_queue")]
    pub notifications_queue: usize,
    /// Delay before the first pass of a notification whose start time already passed.
    #[serde(default = "default_grace_delay")]
    pub grace_delay_secs: u64,
    /// Interval between passes of the same notification.
    #[serde(default = "default_rerun_interval")]
    pub rerun_interval_secs: u64,
    /// Pause before an outbound message that hit a transport failure is queued again.
    #[serde(default = "default_redispatch_delay")]
    pub redispatch_delay_ms: u64,
}

fn default_messages_queue() -> usize { 10 }
fn default_responses_queue() -> usize { 10 }
fn default_notifications_queue() -> usize { 5 }
fn default_grace_delay() -> u64 { 10 }
fn default_rerun_interval() -> u64 { 30 * 60 }
fn default_redispatch_delay() -> u64 { 1000 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            messages_queue: default_messages_queue(),
            responses_queue: default_responses_queue(),
            notifications_queue: default_notifications_queue(),
            grace_delay_secs: default_grace_delay(),
            rerun_interval_secs: default_rerun_interval(),
            redispatch_delay_ms: default_redispatch_delay(),
        }
    }
}

impl PipelineConfig {
    pub fn grace_delay(&self) -> Duration {
        Duration::from_secs(self.grace_delay_secs)
    }

    pub fn rerun_interval(&self) -> Duration {
        Duration::from_secs(self.rerun_interval_secs)
    }

    pub fn redispatch_delay(&self) -> Duration {
        Duration::from_millis(self.redispatch_delay_ms)
    }
}
