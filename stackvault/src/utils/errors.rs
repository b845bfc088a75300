//! Error taxonomy for backup, shutdown and restore runs.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("No full backup found: {0}")]
    NoFullBackup(String),

    #[error("Backup chain broken: {0}")]
    ChainBroken(String),

    #[error("Archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// Reserved: never produced while resolution breaks ties deterministically.
    #[error("Ambiguous resolution: {0}")]
    ResolutionAmbiguous(String),

    #[error("Cannot resolve project directory for {0}")]
    UnresolvableProject(String),

    #[error("Container could not be killed: {0}")]
    ContainerUnkillable(String),

    #[error("Health check timed out: {0}")]
    HealthTimeout(String),

    #[error("Partial failure: {failed} of {total} failed")]
    PartialFailure { failed: usize, total: usize },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Compose error: {0}")]
    Compose(String),

    #[error("Required tool missing: {0}")]
    ToolMissing(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<bollard::errors::Error> for VaultError {
    fn from(err: bollard::errors::Error) -> Self {
        VaultError::Runtime(err.to_string())
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultError::Runtime(format!("worker task failed: {}", err))
    }
}

impl From<walkdir::Error> for VaultError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => VaultError::Io(io),
            None => VaultError::DirectoryUnavailable("filesystem loop detected".to_string()),
        }
    }
}

impl VaultError {
    /// Fail-closed errors abort a whole restore run.
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            VaultError::NoFullBackup(_) | VaultError::ChainBroken(_) | VaultError::ArchiveCorrupt(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
