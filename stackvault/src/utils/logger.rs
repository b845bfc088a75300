//! Logging configuration using tracing.
//!
//! Every run writes to stdout and to its own log file, so a backup or restore
//! can be audited after the fact without digging through a shared log.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::utils::timestamp::BackupTimestamp;

/// Initialize logging with the specified level.
///
/// When `log_dir` is set, a run-scoped file `stackvault_<timestamp>.log` is
/// created there and its path returned.
pub fn init(level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join(run_log_name(&BackupTimestamp::now()));
            let file = File::create(&path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(log_path)
}

fn run_log_name(ts: &BackupTimestamp) -> String {
    format!("stackvault_{}.log", ts)
}
