//! Configuration management for backfill
//!
//! Handles loading and validation of backfill.toml configuration files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::progress::TrackerConfig;
use crate::retry::RetryPolicy;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "BACKFILL_CONFIG";

/// File name searched in the working directory and the user config dir
pub const CONFIG_FILE_NAME: &str = "backfill.toml";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Snapshot settings
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Backfill worker settings
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Convergence tracking settings
    #[serde(default)]
    pub tracker: TrackerSection,

    /// Transform settings
    #[serde(default)]
    pub transform: TransformSection,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional append-only log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotConfig {
    /// Snapshot identifier
    #[serde(default = "default_snapshot_name")]
    pub name: String,

    /// Block until the snapshot is durable
    #[serde(default = "default_true")]
    pub wait: bool,

    /// Upper bound on the durability wait, in seconds
    #[serde(default = "default_snapshot_timeout")]
    pub wait_timeout_secs: u64,

    /// Initial status poll interval, in milliseconds
    #[serde(default = "default_snapshot_poll")]
    pub poll_interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            name: default_snapshot_name(),
            wait: true,
            wait_timeout_secs: default_snapshot_timeout(),
            poll_interval_ms: default_snapshot_poll(),
        }
    }
}

fn default_snapshot_name() -> String {
    "rfs-snapshot".to_string()
}

fn default_true() -> bool {
    true
}

fn default_snapshot_timeout() -> u64 {
    5 * 60
}

fn default_snapshot_poll() -> u64 {
    3000
}

/// Backfill worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackfillConfig {
    /// Worker units requested right after start
    #[serde(default = "default_units")]
    pub units: u32,

    /// Documents per bulk write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bulk write attempts before a batch is given up
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    /// Delay before the first bulk retry, in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_initial_delay_ms: u64,

    /// Clear the target and create indices from source settings before running
    #[serde(default = "default_true")]
    pub prepare_target: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            units: default_units(),
            batch_size: default_batch_size(),
            retry_max_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_delay(),
            prepare_target: true,
        }
    }
}

fn default_units() -> u32 {
    5
}

fn default_batch_size() -> usize {
    500
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    100
}

impl BackfillConfig {
    /// Retry policy applied to bulk writes
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_attempts: Some(self.retry_max_attempts),
            ..RetryPolicy::bulk_write()
        }
    }
}

/// Convergence tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerSection {
    /// Seconds between count polls
    #[serde(default = "default_tracker_interval")]
    pub poll_interval_secs: u64,

    /// Consecutive equal nonzero samples that declare stability
    #[serde(default = "default_stability_samples")]
    pub stability_samples: usize,

    /// Poll budget before giving up
    #[serde(default = "default_max_ticks")]
    pub max_ticks: u32,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_tracker_interval(),
            stability_samples: default_stability_samples(),
            max_ticks: default_max_ticks(),
        }
    }
}

fn default_tracker_interval() -> u64 {
    30
}

fn default_stability_samples() -> usize {
    3
}

fn default_max_ticks() -> u32 {
    30
}

impl TrackerSection {
    #[must_use]
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            interval: Duration::from_secs(self.poll_interval_secs),
            stability_samples: self.stability_samples,
            max_ticks: self.max_ticks,
        }
    }
}

/// Transform configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TransformSection {
    /// Path to a transformation JSON file; identity when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order: `$BACKFILL_CONFIG`, `./backfill.toml`, then
    /// `<config dir>/backfill/backfill.toml`. Falls back to defaults.
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Self::load_from(Path::new(&path));
            }
        }
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "Loading config");
                return Self::load_from(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Candidate config files, in lookup order
    #[must_use]
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("backfill").join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(raw: &str) -> crate::Result<Self> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Reject values that would make the engine spin or never converge
    pub fn validate(&self) -> crate::Result<()> {
        let mut problems = Vec::new();
        if self.general.log_level.parse::<crate::logging::LogLevel>().is_err() {
            problems.push(format!("general.log_level `{}` is unknown", self.general.log_level));
        }
        if self.snapshot.name.trim().is_empty() {
            problems.push("snapshot.name must not be empty".to_string());
        }
        if self.snapshot.wait_timeout_secs == 0 {
            problems.push("snapshot.wait_timeout_secs must be positive".to_string());
        }
        if self.backfill.units == 0 {
            problems.push("backfill.units must be at least 1".to_string());
        }
        if self.backfill.batch_size == 0 {
            problems.push("backfill.batch_size must be at least 1".to_string());
        }
        if self.backfill.retry_max_attempts == 0 {
            problems.push("backfill.retry_max_attempts must be at least 1".to_string());
        }
        if self.tracker.stability_samples == 0 {
            problems.push("tracker.stability_samples must be at least 1".to_string());
        }
        if self.tracker.max_ticks == 0 {
            problems.push("tracker.max_ticks must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(problems.join("; ")).into())
        }
    }
}
