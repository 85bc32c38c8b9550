//! Engine configuration file support.
//!
//! Every field has a default so a partial (or empty) TOML file is valid.

use crate::retry::RetryPolicy;
use meshforge_backends::BackendSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default size cap for staged local files (20 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 20 * 1024 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool size.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-call submit deadline for normal jobs.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,

    /// Per-call submit deadline for large-parameter jobs.
    #[serde(default = "default_extended_deadline_secs")]
    pub extended_deadline_secs: u64,

    /// How long a finished task's progress stays available to subscribers.
    #[serde(default = "default_progress_retention_secs")]
    pub progress_retention_secs: u64,

    /// Retry settings shared by all backends.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Source staging settings.
    #[serde(default)]
    pub staging: StagingConfig,

    /// Job store selection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Provider connection settings.
    #[serde(default)]
    pub backends: BackendSettings,
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts for transient failures, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

/// Staging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Largest local file accepted for staging.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

/// Which job store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local maps.
    #[default]
    Memory,
    /// SQLite database file.
    Sqlite,
}

/// Job store configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation.
    #[serde(default)]
    pub kind: StoreKind,
    /// Database path when `kind = "sqlite"`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_deadline_secs: default_deadline_secs(),
            extended_deadline_secs: default_extended_deadline_secs(),
            progress_retention_secs: default_progress_retention_secs(),
            retry: RetryConfig::default(),
            staging: StagingConfig::default(),
            store: StoreConfig::default(),
            backends: BackendSettings::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self { max_file_bytes: default_max_file_bytes() }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that deserialize fine but cannot drive the engine.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue("max_concurrency must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue("retry.multiplier must be >= 1.0".to_string()));
        }
        if self.store.kind == StoreKind::Sqlite && self.store.path.is_none() {
            return Err(ConfigError::InvalidValue("store.path is required for the sqlite store".to_string()));
        }
        Ok(())
    }

    /// Retry policy built from the `[retry]` table.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.initial_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
            self.retry.multiplier,
        )
    }

    /// Deadline for normal jobs.
    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }

    /// Deadline for large-parameter jobs.
    pub fn extended_deadline(&self) -> Duration {
        Duration::from_secs(self.extended_deadline_secs)
    }

    /// Retention window for finished progress streams.
    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_deadline_secs() -> u64 {
    300
}

const fn default_extended_deadline_secs() -> u64 {
    1800
}

const fn default_progress_retention_secs() -> u64 {
    600
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_file_bytes() -> u64 {
    DEFAULT_MAX_FILE_BYTES
}
