//! Restore pipeline: resolve a chain, apply it, then bring containers back.

pub mod apply;
pub mod resolver;
pub mod scheduler;

pub use apply::{apply_chain, ApplyReport, StagingDir};
pub use resolver::{resolve_chain, BackupChain};
pub use scheduler::{RestoreResult, RestoreScheduler, RestoreSettings, RestoreTask, TaskState};
