//! Pigeon configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PigeonError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PigeonConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub sms: Option<SmsConfig>,
    #[serde(default)]
    pub push: Option<PushConfig>,
}

impl PigeonConfig {
    /// Load config from the default path (~/.pigeon/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PigeonError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PigeonError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PigeonError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Pigeon home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pigeon")
    }
}

/// Polling worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Re-arm retryable failures at the start of each cycle.
    #[serde(default = "bool_true")]
    pub requeue_failed: bool,
    /// Base delay for exponential retry backoff.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

fn bool_true() -> bool { true }
fn default_poll_interval() -> u64 { 30 }
fn default_retry_backoff() -> u64 { 60 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            requeue_failed: true,
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Reject bad cron expressions and unknown zones instead of degrading.
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_max_retries() -> u32 { 3 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strict: false,
            default_max_retries: default_max_retries(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.pigeon/pigeon.db".into() }

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn resolved_db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

/// SMTP email provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from_address: String,
    #[serde(default)]
    pub from_name: Option<String>,
}

fn default_smtp_port() -> u16 { 587 }

/// HTTP SMS gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

/// HTTP push gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub endpoint: String,
    #[serde(default)]
    pub server_key: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 { 10 }
