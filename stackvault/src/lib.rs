//! stackvault library
//!
//! Point-in-time backup and restore for fleets of compose-managed containers:
//! incremental archive chains, fail-closed restore resolution, and batched
//! container restarts with health verification.

pub mod archive;
pub mod backup;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod executor;
pub mod fs;
pub mod health;
pub mod restore;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, VaultError};
