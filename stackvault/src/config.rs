//! Configuration management.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`STACKVAULT__RESTORE__CONCURRENCY=5`). Every field has a
//! default, so an empty configuration is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{Result, VaultError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub shutdown: ShutdownConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory whose subdirectories are compose projects
    pub services_root: PathBuf,

    /// One snapshot store per project lives below this directory
    pub backup_root: PathBuf,

    /// Container and project records
    pub state_dir: PathBuf,

    /// Scratch space for chain replay
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Marker age (days) after which a full backup is forced
    pub staleness_days: i64,

    /// Sets and records older than this (days) are pruned
    pub retention_days: i64,

    /// zstd level; kept low to bound CPU cost
    pub compression_level: i32,

    /// Fraction of CPUs given to compression workers
    pub cpu_fraction: f64,

    /// Entry names never archived
    pub exclude_patterns: Vec<String>,

    /// Bring projects back up once their backup is taken
    pub restart_after_backup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Containers restored per batch
    pub concurrency: usize,

    /// Attempts to bring a container up
    pub max_retries: u32,

    pub retry_delay_secs: u64,
    pub health_timeout_secs: u64,
    pub health_interval_secs: u64,

    /// Pull images before bringing a service up
    pub pull_images: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopOrder {
    /// Containers nothing depends on first, then the rest
    Heuristic,
    /// Full topological sort of the dependency hints
    Topological,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub graceful_timeout_secs: u64,
    pub sigterm_wait_secs: u64,
    pub sigkill_wait_secs: u64,
    pub poll_interval_millis: u64,
    pub order: StopOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Run-scoped log files go here; `None` logs to stdout only
    pub dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            services_root: PathBuf::from("/opt/docker"),
            backup_root: PathBuf::from("/var/backups/stackvault"),
            state_dir: PathBuf::from("/var/lib/stackvault/state"),
            staging_dir: PathBuf::from("/var/lib/stackvault/staging"),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            staleness_days: 7,
            retention_days: 30,
            compression_level: 3,
            cpu_fraction: 0.75,
            exclude_patterns: vec![
                ".git".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
            restart_after_backup: true,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            retry_delay_secs: 5,
            health_timeout_secs: 120,
            health_interval_secs: 2,
            pull_images: false,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: 30,
            sigterm_wait_secs: 10,
            sigkill_wait_secs: 5,
            poll_interval_millis: 500,
            order: StopOrder::Heuristic,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: Some(PathBuf::from("/var/log/stackvault")),
        }
    }
}

impl BackupConfig {
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_days)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

impl RestoreConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

impl ShutdownConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn sigterm_wait(&self) -> Duration {
        Duration::from_secs(self.sigterm_wait_secs)
    }

    pub fn sigkill_wait(&self) -> Duration {
        Duration::from_secs(self.sigkill_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (if any), then
    /// `STACKVAULT__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("STACKVAULT")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.restore.concurrency == 0 {
            return Err(VaultError::Config("restore.concurrency must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.backup.cpu_fraction) || self.backup.cpu_fraction == 0.0 {
            return Err(VaultError::Config("backup.cpu_fraction must be in (0, 1]".into()));
        }
        if self.backup.staleness_days <= 0 || self.backup.retention_days <= 0 {
            return Err(VaultError::Config("backup windows must be positive".into()));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VaultError::Config(e.to_string()))
    }
}
