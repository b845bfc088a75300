//! Restore scheduler: brings recorded containers back in bounded batches.
//!
//! Each container record becomes one task. Tasks of a batch run as
//! independent tokio tasks and hand their outcome back through a oneshot
//! slot; the scheduler waits for every slot of a batch before starting the
//! next one. A failing task never affects its siblings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RestoreConfig;
use crate::discovery;
use crate::health::await_healthy;
use crate::runtime::{ComposeRuntime, ContainerRuntime};
use crate::state::ContainerRecord;
use crate::transfer::progress::{format_duration, ProgressTracker};
use crate::utils::errors::{Result, VaultError};
use crate::utils::timestamp::BackupTimestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed(_))
    }
}

/// One container to bring back, as of `target`.
#[derive(Debug, Clone)]
pub struct RestoreTask {
    pub record: ContainerRecord,
    pub target: BackupTimestamp,
    pub state: TaskState,
    pub attempts: u32,
    pub batch: usize,
}

impl RestoreTask {
    pub fn new(record: ContainerRecord, target: BackupTimestamp) -> Self {
        Self {
            record,
            target,
            state: TaskState::Pending,
            attempts: 0,
            batch: 0,
        }
    }
}

/// What a task reports through its result slot.
#[derive(Debug)]
struct TaskReport {
    state: TaskState,
    attempts: u32,
}

#[derive(Debug, Default)]
pub struct RestoreResult {
    pub succeeded: usize,
    pub failed: usize,
    /// Final state of every task, in record order
    pub tasks: Vec<RestoreTask>,
    /// Number of tasks in each batch
    pub batches: Vec<usize>,
    pub elapsed: Duration,
}

impl RestoreResult {
    pub fn failures(&self) -> impl Iterator<Item = &RestoreTask> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Failed(_)))
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub health_timeout: Duration,
    pub health_interval: Duration,
    pub pull_images: bool,
    /// Searched when a record's project directory is unknown or gone
    pub services_root: PathBuf,
}

impl RestoreSettings {
    pub fn from_config(config: &RestoreConfig, services_root: &Path) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_attempts: config.max_retries.max(1),
            retry_delay: config.retry_delay(),
            health_timeout: config.health_timeout(),
            health_interval: config.health_interval(),
            pull_images: config.pull_images,
            services_root: services_root.to_path_buf(),
        }
    }
}

/// Shared by every task of a run.
#[derive(Clone)]
struct TaskContext {
    runtime: Arc<dyn ContainerRuntime>,
    compose: Arc<dyn ComposeRuntime>,
    settings: Arc<RestoreSettings>,
}

pub struct RestoreScheduler {
    ctx: TaskContext,
    cancel: CancellationToken,
}

impl RestoreScheduler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        compose: Arc<dyn ComposeRuntime>,
        settings: RestoreSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx: TaskContext {
                runtime,
                compose,
                settings: Arc::new(settings),
            },
            cancel,
        }
    }

    /// Restore every record, `concurrency` at a time.
    pub async fn restore_containers(
        &self,
        records: Vec<ContainerRecord>,
        target: BackupTimestamp,
    ) -> RestoreResult {
        let concurrency = self.ctx.settings.concurrency.max(1);
        let mut tasks: Vec<RestoreTask> = records
            .into_iter()
            .map(|r| RestoreTask::new(r, target))
            .collect();
        let batch_count = tasks.len().div_ceil(concurrency);
        let mut progress = ProgressTracker::new(tasks.len());
        let mut result = RestoreResult::default();

        info!(
            "Restoring {} container(s) in {} batch(es) of up to {}",
            tasks.len(),
            batch_count,
            concurrency
        );

        for (index, batch) in tasks.chunks_mut(concurrency).enumerate() {
            let number = index + 1;
            if self.cancel.is_cancelled() {
                for task in batch.iter_mut() {
                    task.batch = number;
                    task.state = TaskState::Failed(VaultError::Interrupted.to_string());
                }
                continue;
            }

            let mut slots = Vec::with_capacity(batch.len());
            for task in batch.iter_mut() {
                let (tx, rx) = oneshot::channel();
                let ctx = self.ctx.clone();
                let record = task.record.clone();
                task.batch = number;
                task.state = TaskState::Running;
                tokio::spawn(async move {
                    let report = run_task(&ctx, &record).await;
                    let _ = tx.send(report);
                });
                slots.push(rx);
            }

            // Batch barrier
            let (mut ok, mut failed) = (0, 0);
            for (task, slot) in batch.iter_mut().zip(slots) {
                let report = slot.await.unwrap_or_else(|_| TaskReport {
                    state: TaskState::Failed("restore task aborted".to_string()),
                    attempts: 0,
                });
                task.attempts = report.attempts;
                task.state = report.state;
                match &task.state {
                    TaskState::Succeeded => ok += 1,
                    TaskState::Failed(reason) => {
                        failed += 1;
                        warn!(container = %task.record.name, "Restore failed: {}", reason);
                    }
                    TaskState::Pending | TaskState::Running => {}
                }
            }

            result.batches.push(batch.len());
            let snapshot = progress.record_batch(ok, failed);
            info!("Batch {}/{} done ({} ok, {} failed): {}", number, batch_count, ok, failed, snapshot);
        }

        result.succeeded = tasks.iter().filter(|t| t.state == TaskState::Succeeded).count();
        result.failed = tasks.len() - result.succeeded;
        result.elapsed = progress.elapsed();
        result.tasks = tasks;

        info!(
            "Restore finished: {} succeeded, {} failed in {}",
            result.succeeded,
            result.failed,
            format_duration(result.elapsed.as_secs())
        );
        result
    }
}

/// Recorded working directory first, then a unique discovered directory.
pub fn resolve_project_dir(record: &ContainerRecord, services_root: &Path) -> Result<PathBuf> {
    if let Some(dir) = &record.project_directory {
        if dir.is_dir() {
            return Ok(dir.clone());
        }
        warn!(
            container = %record.name,
            "Recorded project directory {} is gone, searching {}",
            dir.display(),
            services_root.display()
        );
    }
    discovery::find_project(services_root, &record.project)
        .map(|found| found.path)
        .map_err(|e| match e {
            VaultError::UnresolvableProject(_) => e,
            other => VaultError::UnresolvableProject(format!("{}: {}", record.project, other)),
        })
}

async fn run_task(ctx: &TaskContext, record: &ContainerRecord) -> TaskReport {
    let settings = &ctx.settings;
    let dir = match resolve_project_dir(record, &settings.services_root) {
        Ok(dir) => dir,
        Err(e) => {
            return TaskReport {
                state: TaskState::Failed(e.to_string()),
                attempts: 0,
            }
        }
    };
    let service = record.service.as_deref();

    if settings.pull_images {
        if let Err(e) = ctx.compose.pull(&dir, service).await {
            warn!(container = %record.name, "Image pull failed, using local image: {}", e);
        }
    }

    let mut attempts = 0;
    loop {
        attempts += 1;
        match ctx.compose.up(&dir, service).await {
            Ok(()) => break,
            Err(e) if attempts < settings.max_attempts => {
                warn!(
                    container = %record.name,
                    "Start attempt {}/{} failed: {}",
                    attempts,
                    settings.max_attempts,
                    e
                );
                sleep(settings.retry_delay).await;
            }
            Err(e) => {
                return TaskReport {
                    state: TaskState::Failed(e.to_string()),
                    attempts,
                }
            }
        }
    }

    let state = match await_healthy(
        ctx.runtime.as_ref(),
        &record.name,
        settings.health_timeout,
        settings.health_interval,
    )
    .await
    {
        Ok(outcome) if outcome.is_healthy() => {
            info!(container = %record.name, "Container restored");
            TaskState::Succeeded
        }
        Ok(outcome) => TaskState::Failed(
            VaultError::HealthTimeout(format!("{} {}", record.name, outcome)).to_string(),
        ),
        Err(e) => TaskState::Failed(e.to_string()),
    };

    TaskReport { state, attempts }
}
