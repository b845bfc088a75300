//! Run executor - Orchestrates backup, restore and stop runs.
//!
//! This module ties the components together:
//! - Service discovery and state recording
//! - Shutdown coordination
//! - Chain building and retention
//! - Chain resolution, apply and container restore
//! - Interrupt cleanup

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{self, BackupReport, ChainBuilder};
use crate::config::Config;
use crate::daemon::interrupt;
use crate::discovery::{self, ServiceDirectory};
use crate::fs::walker::{walk_directory, WalkOptions};
use crate::restore::{
    apply_chain, resolve_chain, BackupChain, RestoreScheduler, RestoreSettings, TaskState,
};
use crate::runtime::{ComposeRuntime, ContainerRuntime};
use crate::shutdown::{EscalationSettings, ShutdownCoordinator, StopReport};
use crate::state::{ContainerRecord, ProjectRecord, StateRecorder};
use crate::store::{SetEntry, StoreLayout};
use crate::transfer::progress::format_duration;
use crate::utils::errors::{Result, VaultError};
use crate::utils::timestamp::BackupTimestamp;

/// Terminal summary of a run
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed items with the reason
    pub failures: Vec<(String, String)>,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, name: &str, result: std::result::Result<(), String>) {
        self.processed += 1;
        match result {
            Ok(()) => self.succeeded += 1,
            Err(reason) => {
                self.failed += 1;
                self.failures.push((name.to_string(), reason));
            }
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed {}, succeeded {}, failed {} in {}",
            self.processed,
            self.succeeded,
            self.failed,
            format_duration(self.elapsed.as_secs())
        )?;
        if self.interrupted {
            write!(f, " (interrupted)")?;
        }
        Ok(())
    }
}

/// Backup sets of one project, for listing
#[derive(Debug, Clone)]
pub struct ProjectListing {
    pub project: String,
    pub sets: Vec<(SetEntry, u64)>,
}

/// Main run executor
pub struct Executor {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    compose: Arc<dyn ComposeRuntime>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        compose: Arc<dyn ComposeRuntime>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            runtime,
            compose,
            cancel,
        }
    }

    fn layout(&self) -> StoreLayout {
        StoreLayout::new(&self.config.paths.backup_root)
    }

    fn recorder(&self) -> StateRecorder {
        StateRecorder::new(&self.config.paths.state_dir)
    }

    fn coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(
            self.runtime.clone(),
            self.compose.clone(),
            EscalationSettings::from(&self.config.shutdown),
        )
    }

    /// The Docker daemon must answer and `docker compose` must run
    pub async fn check_tools(&self) -> Result<()> {
        self.runtime.ping().await?;
        let version = self.compose.version().await?;
        info!("Using docker compose {}", version);
        Ok(())
    }

    /// Back up every discovered service directory
    pub async fn backup_run(&self) -> Result<RunSummary> {
        let start_time = Instant::now();
        let services_root = &self.config.paths.services_root;
        let dirs = discovery::discover(services_root)?;
        if dirs.is_empty() {
            return Err(VaultError::DirectoryUnavailable(format!(
                "no service directories under {}",
                services_root.display()
            )));
        }

        let timestamp = BackupTimestamp::now();
        info!("Starting backup run {} for {} project(s)", timestamp, dirs.len());

        let mut summary = RunSummary::default();
        for dir in &dirs {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let result = self.backup_project(dir, timestamp).await;
            if let Err(e) = &result {
                error!(project = %dir.name, "Backup failed: {}", e);
            }
            summary.record(&dir.name, result.map(|_| ()).map_err(|e| e.to_string()));
        }

        if let Err(e) = self.recorder().prune(timestamp, self.config.backup.retention()) {
            warn!("Record pruning failed: {}", e);
        }

        summary.elapsed = start_time.elapsed();
        info!("Backup run finished: {}", summary);
        Ok(summary)
    }

    async fn backup_project(&self, dir: &ServiceDirectory, timestamp: BackupTimestamp) -> Result<BackupReport> {
        let running = self.compose.ps(&dir.path).await?;
        self.recorder()
            .record_running(self.runtime.as_ref(), &dir.name, &running, timestamp)
            .await?;

        let stop = self.coordinator().stop_project(&dir.path).await;
        let result = match stop.and_then(StopReport::into_result) {
            Ok(_) => self.archive_project(dir, timestamp).await,
            Err(e) => {
                warn!(project = %dir.name, "Project not quiesced, backup suppressed");
                Err(e)
            }
        };

        if self.config.backup.restart_after_backup && !running.is_empty() {
            if let Err(e) = self.compose.up(&dir.path, None).await {
                warn!(project = %dir.name, "Failed to restart project: {}", e);
            }
        }

        result
    }

    async fn archive_project(&self, dir: &ServiceDirectory, timestamp: BackupTimestamp) -> Result<BackupReport> {
        let store = self.layout().project(&dir.name)?;
        let builder = ChainBuilder::from_config(&self.config.backup);
        let excludes = self.config.backup.exclude_patterns.clone();
        let retention = self.config.backup.retention();
        let recorder = self.recorder();
        let project = dir.name.clone();
        let path = dir.path.clone();

        tokio::task::spawn_blocking(move || -> Result<BackupReport> {
            let scanned = walk_directory(&path, WalkOptions::with_excludes(excludes))?;
            recorder.write_project(&ProjectRecord::new(&project, &path, timestamp, &scanned))?;

            let report = builder.create_backup(&path, &store, timestamp)?;
            backup::prune(&store, timestamp, retention)?;
            Ok(report)
        })
        .await?
    }

    /// Resolve, apply and restart every selected project
    pub async fn restore_run(&self, at: Option<BackupTimestamp>, projects: &[String]) -> Result<RunSummary> {
        let start_time = Instant::now();
        let target = at.unwrap_or_else(BackupTimestamp::now);
        let selected = self.select_projects(projects)?;

        // Every chain is resolved before anything is touched
        let chains = self.resolve_all(&selected, target).await.inspect_err(|e| {
            if e.is_fail_closed() {
                error!("Restore aborted before any change: {}", e);
            }
        })?;

        let recorder = self.recorder();
        let mut summary = RunSummary::default();
        let mut records = Vec::new();
        let mut restored = Vec::new();
        for (project, chain) in &chains {
            if self.cancel.is_cancelled() {
                break;
            }
            // A failed apply stays with its project; the others still restart
            match self.apply_project(&recorder, project, chain).await {
                Ok(project_records) => {
                    info!(project = %project, "{} container record(s) to restore", project_records.len());
                    restored.push(project.clone());
                    for record in &project_records {
                        if !restored.contains(&record.project_name) {
                            restored.push(record.project_name.clone());
                        }
                    }
                    records.extend(project_records);
                }
                Err(e) => {
                    error!(project = %project, "Apply failed, project left down: {}", e);
                    summary.record(project, Err(format!("apply failed: {}", e)));
                }
            }
        }

        let scheduler = RestoreScheduler::new(
            self.runtime.clone(),
            self.compose.clone(),
            RestoreSettings::from_config(&self.config.restore, &self.config.paths.services_root),
            self.cancel.clone(),
        );
        let result = scheduler.restore_containers(records, target).await;

        for task in &result.tasks {
            let outcome = match &task.state {
                TaskState::Succeeded => Ok(()),
                TaskState::Failed(reason) => Err(reason.clone()),
                other => Err(format!("left in state {:?}", other)),
            };
            summary.record(&task.record.name, outcome);
        }

        if self.cancel.is_cancelled() {
            summary.interrupted = true;
            interrupt::cleanup(self.runtime.as_ref(), &self.config.paths.staging_dir, &restored).await;
        }

        summary.elapsed = start_time.elapsed();
        info!("Restore run finished: {}", summary);
        Ok(summary)
    }

    /// Bring the project down, replay its chain and load its container records
    async fn apply_project(
        &self,
        recorder: &StateRecorder,
        project: &str,
        chain: &BackupChain,
    ) -> Result<Vec<ContainerRecord>> {
        let destination = chain.tip().source_root.clone();
        if discovery::compose_manifest(&destination).is_some() {
            if let Err(e) = self.compose.down(&destination, true).await {
                warn!(project = %project, "compose down failed: {}", e);
            }
        }

        let chain_owned = chain.clone();
        let staging_root = self.config.paths.staging_dir.clone();
        let excludes = self.config.backup.exclude_patterns.clone();
        tokio::task::spawn_blocking(move || apply_chain(&chain_owned, &destination, &staging_root, &excludes))
            .await??;

        recorder.project_containers(project, chain.tip().timestamp)
    }

    /// Resolve and verify chains without applying them
    pub async fn verify_run(&self, at: Option<BackupTimestamp>, projects: &[String]) -> Result<Vec<(String, BackupChain)>> {
        let target = at.unwrap_or_else(BackupTimestamp::now);
        let selected = self.select_projects(projects)?;
        self.resolve_all(&selected, target).await
    }

    pub async fn stop_run(&self, directory: &Path) -> Result<StopReport> {
        self.coordinator().stop_project(directory).await
    }

    /// Backup sets per project with their sizes
    pub fn list(&self, projects: &[String]) -> Result<Vec<ProjectListing>> {
        let layout = self.layout();
        let mut listings = Vec::new();
        for project in self.select_projects(projects)? {
            let store = layout.project(&project)?;
            let sets = store
                .list()?
                .into_iter()
                .map(|s| {
                    let size = std::fs::metadata(&s.archive_path).map(|m| m.len()).unwrap_or(0);
                    (s, size)
                })
                .collect();
            listings.push(ProjectListing { project, sets });
        }
        Ok(listings)
    }

    /// Projects with backups, narrowed to `requested` when given
    fn select_projects(&self, requested: &[String]) -> Result<Vec<String>> {
        let available = self.layout().projects()?;
        if available.is_empty() {
            return Err(VaultError::NoFullBackup(format!(
                "no backups under {}",
                self.config.paths.backup_root.display()
            )));
        }
        if requested.is_empty() {
            return Ok(available);
        }
        requested
            .iter()
            .map(|p| {
                if available.contains(p) {
                    Ok(p.clone())
                } else {
                    Err(VaultError::NoFullBackup(format!("no backups for project {}", p)))
                }
            })
            .collect()
    }

    async fn resolve_all(&self, projects: &[String], target: BackupTimestamp) -> Result<Vec<(String, BackupChain)>> {
        let layout = self.layout();
        let mut chains = Vec::with_capacity(projects.len());
        for project in projects {
            let store = layout.project(project)?;
            let chain = tokio::task::spawn_blocking(move || resolve_chain(&store, target)).await??;
            chains.push((project.clone(), chain));
        }
        Ok(chains)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.config.paths.backup_root.clone()
    }
}
