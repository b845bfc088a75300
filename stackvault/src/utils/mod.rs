//! Utility modules shared across the crate.

pub mod errors;
pub mod logger;
pub mod timestamp;

pub use errors::{Result, VaultError};
pub use timestamp::BackupTimestamp;
