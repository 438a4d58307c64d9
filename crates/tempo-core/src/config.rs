//! Tempo configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TempoError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempoConfig {
    /// Where Tempo keeps its database and state (default `~/.tempo`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tempo")
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TempoConfig {
    /// Load config from the default path (`~/.tempo/config.toml`).
    /// Missing file means defaults, not an error.
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
            .map_err(|e| TempoError::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TempoError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Path of the scheduler database inside the data dir.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tempo.db")
    }
}

/// Scheduling engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Safety-net sweep cadence.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Global cap on simultaneously in-flight executions.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Failure count at which a task is marked failed, unless overridden per task.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub default_retry_interval_ms: u64,
    /// Per-execution bookkeeping timeout. 0 disables it.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Execution logs older than this are purged at startup.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
}

fn default_check_interval_ms() -> u64 {
    1_000
}
fn default_max_concurrent_tasks() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    60_000
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_log_retention_days() -> i64 {
    7
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_max_retries: default_max_retries(),
            default_retry_interval_ms: default_retry_interval_ms(),
            default_timeout_ms: default_timeout_ms(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_contract() {
        let config = SchedulerConfig::default();
        assert_eq!(config.check_interval_ms, 1_000);
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.log_retention_days, 7);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: TempoConfig = toml::from_str(
            r#"
            [scheduler]
            max_concurrent_tasks = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 8);
        assert_eq!(config.scheduler.check_interval_ms, 1_000);
    }
}
