//! Container and compose runtime interfaces.
//!
//! The orchestration code only talks to these traits. `docker` implements the
//! container side on the Docker Engine API; `compose` drives the
//! `docker compose` CLI.

pub mod compose;
pub mod docker;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::Result;

pub use compose::DockerCompose;
pub use docker::DockerRuntime;

/// Compose labels read from inspected containers.
pub const LABEL_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_WORKING_DIR: &str = "com.docker.compose.project.working_dir";
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
pub const LABEL_DEPENDS_ON: &str = "com.docker.compose.depends_on";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No probe result available
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Inspection result for one container.
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub pid: i64,
    pub status: String,
    pub health: HealthStatus,
    /// The container declares a health probe
    pub has_probe: bool,
    pub labels: HashMap<String, String>,
    pub image: String,
    pub networks: Vec<String>,
    /// Legacy link targets (container names)
    pub links: Vec<String>,
    /// Full inspection payload
    pub raw: serde_json::Value,
}

impl ContainerState {
    pub fn project_name(&self) -> Option<&str> {
        self.labels.get(LABEL_PROJECT).map(String::as_str)
    }

    pub fn project_dir(&self) -> Option<PathBuf> {
        self.labels.get(LABEL_WORKING_DIR).map(PathBuf::from)
    }

    pub fn service(&self) -> Option<&str> {
        self.labels.get(LABEL_SERVICE).map(String::as_str)
    }

    /// Service names from the compose `depends_on` label
    /// (`db:service_healthy:false,cache:service_started:true`).
    pub fn depends_on_services(&self) -> Vec<String> {
        self.labels
            .get(LABEL_DEPENDS_ON)
            .map(|raw| {
                raw.split(',')
                    .filter_map(|item| item.split(':').next())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Filter for container listings
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub labels: Vec<(String, String)>,
    /// Docker status (`running`, `created`, `exited`); `None` means running
    pub status: Option<String>,
}

impl ContainerFilter {
    pub fn project(name: &str) -> Self {
        Self {
            labels: vec![(LABEL_PROJECT.to_string(), name.to_string())],
            status: None,
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fails when the daemon is unreachable.
    async fn ping(&self) -> Result<()>;

    /// `None` when the container no longer exists.
    async fn inspect(&self, container: &str) -> Result<Option<ContainerState>>;

    /// Graceful stop; the runtime escalates by itself after `timeout`.
    async fn stop(&self, container: &str, timeout: Duration) -> Result<()>;

    async fn kill(&self, container: &str, signal: Signal) -> Result<()>;

    async fn remove(&self, container: &str) -> Result<()>;

    /// Container names matching `filter`.
    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<String>>;
}

#[async_trait]
pub trait ComposeRuntime: Send + Sync {
    /// Version string of the compose tool; fails when it is missing.
    async fn version(&self) -> Result<String>;

    /// Start the project, or only `service` when given.
    async fn up(&self, project_dir: &Path, service: Option<&str>) -> Result<()>;

    async fn down(&self, project_dir: &Path, remove_orphans: bool) -> Result<()>;

    async fn pull(&self, project_dir: &Path, service: Option<&str>) -> Result<()>;

    /// Running containers of the project.
    async fn ps(&self, project_dir: &Path) -> Result<Vec<String>>;
}
