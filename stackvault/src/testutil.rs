//! In-memory container and compose runtime for tests.
//!
//! Containers are scripted up front: whether they ignore each stop signal,
//! what health they report on successive inspections, and how many times
//! `compose up` fails for them before succeeding. Every call is logged so
//! tests can assert on ordering.

use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::runtime::{
    ComposeRuntime, ContainerFilter, ContainerRuntime, ContainerState, HealthStatus,
    LABEL_DEPENDS_ON, LABEL_PROJECT, LABEL_SERVICE, LABEL_WORKING_DIR,
};
use crate::utils::errors::{Result, VaultError};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub name: String,
    pub project: Option<String>,
    pub project_dir: Option<PathBuf>,
    pub service: Option<String>,
    pub running: bool,
    pub status: String,
    pub has_probe: bool,
    health_script: VecDeque<HealthStatus>,
    health_on_up: Vec<HealthStatus>,
    pub ignores_stop: bool,
    pub ignores_sigterm: bool,
    pub ignores_sigkill: bool,
    pub links: Vec<String>,
    pub depends_on: Vec<String>,
}

impl FakeContainer {
    pub fn running(name: &str) -> Self {
        Self {
            name: name.to_string(),
            project: None,
            project_dir: None,
            service: Some(name.to_string()),
            running: true,
            status: "running".to_string(),
            has_probe: false,
            health_script: VecDeque::new(),
            health_on_up: Vec::new(),
            ignores_stop: false,
            ignores_sigterm: false,
            ignores_sigkill: false,
            links: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn stopped(name: &str) -> Self {
        let mut c = Self::running(name);
        c.running = false;
        c.status = "exited".to_string();
        c
    }

    pub fn created(name: &str) -> Self {
        let mut c = Self::stopped(name);
        c.status = "created".to_string();
        c
    }

    /// Declares a probe; each inspection consumes one status, the last one sticks.
    /// The same script replays after every `compose up`.
    pub fn with_health(mut self, script: Vec<HealthStatus>) -> Self {
        self.has_probe = true;
        self.health_on_up = script.clone();
        self.health_script = script.into();
        self
    }

    pub fn in_project(mut self, project: &str, dir: &Path) -> Self {
        self.project = Some(project.to_string());
        self.project_dir = Some(dir.to_path_buf());
        self
    }

    pub fn service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn linked_to(mut self, targets: &[&str]) -> Self {
        self.links = targets.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, services: &[&str]) -> Self {
        self.depends_on = services.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn stubborn(mut self, stop: bool, sigterm: bool, sigkill: bool) -> Self {
        self.ignores_stop = stop;
        self.ignores_sigterm = sigterm;
        self.ignores_sigkill = sigkill;
        self
    }

    fn labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        if let Some(project) = &self.project {
            labels.insert(LABEL_PROJECT.to_string(), project.clone());
        }
        if let Some(dir) = &self.project_dir {
            labels.insert(LABEL_WORKING_DIR.to_string(), dir.display().to_string());
        }
        if let Some(service) = &self.service {
            labels.insert(LABEL_SERVICE.to_string(), service.clone());
        }
        if !self.depends_on.is_empty() {
            let raw: Vec<String> = self
                .depends_on
                .iter()
                .map(|s| format!("{}:service_started:false", s))
                .collect();
            labels.insert(LABEL_DEPENDS_ON.to_string(), raw.join(","));
        }
        labels
    }

    fn halt(&mut self) {
        self.running = false;
        self.status = "exited".to_string();
    }
}

#[derive(Default)]
struct FakeInner {
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<String>,
    inspects: HashMap<String, usize>,
    up_failures: HashMap<String, u32>,
    compose_missing: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeInner>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: FakeContainer) {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.insert(container.name.clone(), container);
    }

    /// `compose up` of `service` fails `times` times before succeeding.
    pub fn fail_up(&self, service: &str, times: u32) {
        self.inner.lock().unwrap().up_failures.insert(service.to_string(), times);
    }

    pub fn set_compose_missing(&self) {
        self.inner.lock().unwrap().compose_missing = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn inspect_count(&self, name: &str) -> usize {
        self.inner.lock().unwrap().inspects.get(name).copied().unwrap_or(0)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.lock().unwrap().containers.contains_key(name)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<Option<ContainerState>> {
        let mut inner = self.inner.lock().unwrap();
        *inner.inspects.entry(container.to_string()).or_default() += 1;
        let Some(c) = inner.containers.get_mut(container) else {
            return Ok(None);
        };

        let health = if c.has_probe && c.running {
            if c.health_script.len() > 1 {
                c.health_script.pop_front().unwrap_or(HealthStatus::None)
            } else {
                c.health_script.front().copied().unwrap_or(HealthStatus::None)
            }
        } else {
            HealthStatus::None
        };

        Ok(Some(ContainerState {
            id: format!("id-{}", c.name),
            name: c.name.clone(),
            running: c.running,
            pid: if c.running { 100 } else { 0 },
            status: c.status.clone(),
            health,
            has_probe: c.has_probe,
            labels: c.labels(),
            image: format!("{}:latest", c.service.as_deref().unwrap_or(&c.name)),
            networks: vec!["default".to_string()],
            links: c.links.clone(),
            raw: serde_json::json!({ "Name": c.name, "State": { "Status": c.status } }),
        }))
    }

    async fn stop(&self, container: &str, _timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("stop:{}", container));
        match inner.containers.get_mut(container) {
            Some(c) if c.ignores_stop => Err(VaultError::Runtime(format!("{} did not stop", container))),
            Some(c) => {
                c.halt();
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn kill(&self, container: &str, signal: Signal) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("kill:{}:{}", container, signal.as_str()));
        if let Some(c) = inner.containers.get_mut(container) {
            let ignored = match signal {
                Signal::SIGTERM => c.ignores_sigterm,
                Signal::SIGKILL => c.ignores_sigkill,
                _ => true,
            };
            if !ignored {
                c.halt();
            }
        }
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("remove:{}", container));
        inner.containers.remove(container);
        Ok(())
    }

    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let status = filter.status.as_deref().unwrap_or("running");
        Ok(inner
            .containers
            .values()
            .filter(|c| c.status == status)
            .filter(|c| {
                let labels = c.labels();
                filter.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|c| c.name.clone())
            .collect())
    }
}

#[async_trait]
impl ComposeRuntime for FakeRuntime {
    async fn version(&self) -> Result<String> {
        if self.inner.lock().unwrap().compose_missing {
            return Err(VaultError::ToolMissing("docker compose".into()));
        }
        Ok("2.24.0".to_string())
    }

    async fn up(&self, project_dir: &Path, service: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!(
            "up:{}:{}",
            project_dir.display(),
            service.unwrap_or("*")
        ));

        if let Some(service) = service {
            if let Some(left) = inner.up_failures.get_mut(service) {
                if *left > 0 {
                    *left -= 1;
                    return Err(VaultError::Compose(format!("{} failed to start", service)));
                }
            }
        }

        for c in inner.containers.values_mut() {
            let in_project = c.project_dir.as_deref() == Some(project_dir);
            let selected = service.map_or(true, |s| c.service.as_deref() == Some(s));
            if in_project && selected {
                c.running = true;
                c.status = "running".to_string();
                c.health_script = c.health_on_up.clone().into();
            }
        }
        Ok(())
    }

    async fn down(&self, project_dir: &Path, remove_orphans: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(format!("down:{}:{}", project_dir.display(), remove_orphans));
        for c in inner.containers.values_mut() {
            if c.project_dir.as_deref() == Some(project_dir) {
                c.halt();
            }
        }
        Ok(())
    }

    async fn pull(&self, project_dir: &Path, service: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!(
            "pull:{}:{}",
            project_dir.display(),
            service.unwrap_or("*")
        ));
        Ok(())
    }

    async fn ps(&self, project_dir: &Path) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .values()
            .filter(|c| c.running && c.project_dir.as_deref() == Some(project_dir))
            .map(|c| c.name.clone())
            .collect())
    }
}
