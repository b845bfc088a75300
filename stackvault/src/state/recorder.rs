//! Container state recorder.
//!
//! Before a project is stopped, each of its running containers is inspected
//! and written to `<state_dir>/<container>_<timestamp>.json`; the project's
//! directory listing goes to `<state_dir>/projects/<project>_<timestamp>.json`.
//! Records are never rewritten and follow the backup retention window.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::fs::walker::{EntryKind, FileInfo};
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::utils::errors::Result;
use crate::utils::timestamp::BackupTimestamp;

const PROJECTS_DIR: &str = "projects";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthKind {
    None,
    Probed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    pub runtime_id: String,
    /// Compose working-dir label, when the container carried one
    pub project_directory: Option<PathBuf>,
    /// Service directory name the record was captured under; keys the backup store
    pub project: String,
    /// Compose project label, normalized by compose and not always the directory name
    pub project_name: String,
    pub service: Option<String>,
    pub image: String,
    pub network_names: Vec<String>,
    pub health_kind: HealthKind,
    /// Full inspection payload
    pub state_blob: serde_json::Value,
    pub timestamp: BackupTimestamp,
}

impl ContainerRecord {
    pub fn from_state(state: &ContainerState, project: &str, timestamp: BackupTimestamp) -> Self {
        Self {
            name: state.name.clone(),
            runtime_id: state.id.clone(),
            project_directory: state.project_dir(),
            project: project.to_string(),
            project_name: state.project_name().unwrap_or(project).to_string(),
            service: state.service().map(String::from),
            image: state.image.clone(),
            network_names: state.networks.clone(),
            health_kind: if state.has_probe {
                HealthKind::Probed
            } else {
                HealthKind::None
            },
            state_blob: state.raw.clone(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub project: String,
    pub directory: PathBuf,
    pub timestamp: BackupTimestamp,
    pub hostname: String,
    pub entries: Vec<ProjectEntry>,
}

impl ProjectRecord {
    pub fn new(project: &str, directory: &Path, timestamp: BackupTimestamp, scanned: &[FileInfo]) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            project: project.to_string(),
            directory: directory.to_path_buf(),
            timestamp,
            hostname,
            entries: scanned
                .iter()
                .map(|e| ProjectEntry {
                    path: e.key(),
                    kind: e.kind,
                    size: e.size,
                    mtime: e.mtime,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateRecorder {
    state_dir: PathBuf,
}

impl StateRecorder {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn projects_dir(&self) -> PathBuf {
        self.state_dir.join(PROJECTS_DIR)
    }

    /// Inspect and record each named container; vanished containers are skipped.
    pub async fn record_running(
        &self,
        runtime: &dyn ContainerRuntime,
        project: &str,
        names: &[String],
        timestamp: BackupTimestamp,
    ) -> Result<Vec<ContainerRecord>> {
        let mut records = Vec::with_capacity(names.len());
        for name in names {
            match runtime.inspect(name).await? {
                Some(state) => {
                    let record = ContainerRecord::from_state(&state, project, timestamp);
                    self.write_container(&record)?;
                    records.push(record);
                }
                None => warn!(container = %name, "Container vanished before it was recorded"),
            }
        }
        info!(project, "Recorded {} container(s)", records.len());
        Ok(records)
    }

    pub fn write_container(&self, record: &ContainerRecord) -> Result<PathBuf> {
        let path = self
            .state_dir
            .join(format!("{}_{}.json", record.name, record.timestamp));
        write_json(&path, record)?;
        debug!("Wrote container record {}", path.display());
        Ok(path)
    }

    pub fn write_project(&self, record: &ProjectRecord) -> Result<PathBuf> {
        let path = self
            .projects_dir()
            .join(format!("{}_{}.json", record.project, record.timestamp));
        write_json(&path, record)?;
        Ok(path)
    }

    /// Every readable container record; unreadable files are skipped.
    pub fn containers(&self) -> Result<Vec<ContainerRecord>> {
        let mut records: Vec<ContainerRecord> = read_records(&self.state_dir)?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        records.sort_by(|a, b| (a.timestamp, &a.name).cmp(&(b.timestamp, &b.name)));
        Ok(records)
    }

    /// Records captured under service directory `project`, from its most
    /// recent capture at or before `at`.
    pub fn project_containers(&self, project: &str, at: BackupTimestamp) -> Result<Vec<ContainerRecord>> {
        let records: Vec<ContainerRecord> = self
            .containers()?
            .into_iter()
            .filter(|r| r.project == project && r.timestamp <= at)
            .collect();
        let Some(latest) = records.iter().map(|r| r.timestamp).max() else {
            return Ok(Vec::new());
        };
        Ok(records.into_iter().filter(|r| r.timestamp == latest).collect())
    }

    /// Delete records older than `retention` relative to `now`.
    pub fn prune(&self, now: BackupTimestamp, retention: chrono::Duration) -> Result<usize> {
        let cutoff = now.minus(retention);
        let mut removed = 0;
        for dir in [self.state_dir.clone(), self.projects_dir()] {
            for path in record_files(&dir)? {
                let expired = record_timestamp(&path).map(|ts| ts < cutoff).unwrap_or(false);
                if expired {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!("Pruned {} state record(s)", removed);
        }
        Ok(removed)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// `.json` files directly inside `dir`.
fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

fn record_timestamp(path: &Path) -> Option<BackupTimestamp> {
    let stem = path.file_stem()?.to_str()?;
    BackupTimestamp::split_suffix(stem).map(|(_, ts)| ts)
}

fn read_records<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<(PathBuf, T)>> {
    let mut records = Vec::new();
    for path in record_files(dir)? {
        if record_timestamp(&path).is_none() {
            continue;
        }
        match fs::read(&path).map_err(|e| e.to_string()).and_then(|raw| {
            serde_json::from_slice::<T>(&raw).map_err(|e| e.to_string())
        }) {
            Ok(record) => records.push((path, record)),
            Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
        }
    }
    Ok(records)
}
