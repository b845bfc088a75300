//! Interruption handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run token. Work already started finishes its own
//! bounded steps; the run then stops scheduling and calls [`cleanup`] to
//! remove staging directories and containers a restore left in the
//! `created` state. Committed steps are never rolled back.

use std::path::Path;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::restore::apply::clean_staging_root;
use crate::runtime::{ContainerFilter, ContainerRuntime};
use crate::utils::errors::Result;

/// Interrupt handler
#[derive(Clone, Default)]
pub struct InterruptHandler {
    token: CancellationToken,
}

impl InterruptHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once a signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token
    pub async fn wait_for_signal(&self) -> Result<()> {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Received SIGINT (Ctrl+C), finishing current work before stopping...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, finishing current work before stopping...");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.token.cancel();
        Ok(())
    }

    /// Watch for signals in the background for the rest of the run
    pub fn spawn(&self) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.wait_for_signal().await {
                warn!("Failed to install signal handlers: {}", e);
            }
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub staging_removed: usize,
    pub containers_removed: Vec<String>,
}

/// Remove what an interrupted restore of `projects` left half-done
pub async fn cleanup(
    runtime: &dyn ContainerRuntime,
    staging_root: &Path,
    projects: &[String],
) -> CleanupReport {
    let mut report = CleanupReport::default();

    match clean_staging_root(staging_root) {
        Ok(n) => report.staging_removed = n,
        Err(e) => warn!("Failed to clean staging root {}: {}", staging_root.display(), e),
    }

    for project in projects {
        let filter = ContainerFilter::project(project).with_status("created");
        let names = match runtime.list(&filter).await {
            Ok(names) => names,
            Err(e) => {
                warn!(project = %project, "Cannot list created containers: {}", e);
                continue;
            }
        };
        for name in names {
            match runtime.remove(&name).await {
                Ok(()) => report.containers_removed.push(name),
                Err(e) => warn!(container = %name, "Failed to remove container: {}", e),
            }
        }
    }

    info!(
        "Interrupt cleanup: {} staging dir(s), {} container(s) removed",
        report.staging_removed,
        report.containers_removed.len()
    );
    report
}
