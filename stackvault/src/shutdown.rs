//! Shutdown coordinator: quiesces a compose project before its backup.
//!
//! Each container walks a bounded escalation: graceful stop, then SIGTERM,
//! then SIGKILL, then `ContainerUnkillable`. Stop order comes from the
//! dependency hints containers carry (legacy links and the compose
//! `depends_on` label). The default order is a heuristic, not a dependency
//! guarantee: containers nothing depends on go first, then the rest.

use nix::sys::signal::Signal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::config::{ShutdownConfig, StopOrder};
use crate::runtime::{ComposeRuntime, ContainerRuntime};
use crate::utils::errors::{Result, VaultError};

/// Step of the escalation that brought a container down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStep {
    Graceful,
    Sigterm,
    Sigkill,
}

#[derive(Debug, Clone, Copy)]
pub struct EscalationSettings {
    pub graceful_timeout: Duration,
    pub sigterm_wait: Duration,
    pub sigkill_wait: Duration,
    pub poll_interval: Duration,
    pub order: StopOrder,
}

impl From<&ShutdownConfig> for EscalationSettings {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            graceful_timeout: config.graceful_timeout(),
            sigterm_wait: config.sigterm_wait(),
            sigkill_wait: config.sigkill_wait(),
            poll_interval: config.poll_interval(),
            order: config.order,
        }
    }
}

/// Outcome of stopping one project
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub project_dir: PathBuf,
    /// Containers in the order they were stopped, with the step that worked
    pub stopped: Vec<(String, StopStep)>,
    pub failed: Vec<(String, String)>,
    /// Still running on the final re-poll
    pub still_running: Vec<String>,
}

impl StopReport {
    /// True when the project's data can be treated as quiesced.
    pub fn is_quiesced(&self) -> bool {
        self.failed.is_empty() && self.still_running.is_empty()
    }

    pub fn into_result(self) -> Result<StopReport> {
        if self.is_quiesced() {
            Ok(self)
        } else {
            Err(VaultError::PartialFailure {
                failed: self.failed.len().max(self.still_running.len()),
                total: self.stopped.len() + self.failed.len(),
            })
        }
    }
}

/// Dependency hints for one container.
#[derive(Debug, Clone)]
struct StopHint {
    name: String,
    /// Containers this one depends on
    depends_on: BTreeSet<String>,
}

pub struct ShutdownCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    compose: Arc<dyn ComposeRuntime>,
    settings: EscalationSettings,
}

impl ShutdownCoordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        compose: Arc<dyn ComposeRuntime>,
        settings: EscalationSettings,
    ) -> Self {
        Self {
            runtime,
            compose,
            settings,
        }
    }

    /// Stop every running container of the project in `directory`.
    pub async fn stop_project(&self, directory: &Path) -> Result<StopReport> {
        if !directory.is_dir() {
            return Err(VaultError::DirectoryUnavailable(directory.display().to_string()));
        }

        let mut report = StopReport {
            project_dir: directory.to_path_buf(),
            ..Default::default()
        };

        let running = self.compose.ps(directory).await?;
        if running.is_empty() {
            info!(project = %directory.display(), "No running containers");
            return Ok(report);
        }

        let hints = self.collect_hints(&running).await?;
        let order = match self.settings.order {
            StopOrder::Heuristic => heuristic_order(&hints),
            StopOrder::Topological => topological_order(&hints),
        };
        info!(project = %directory.display(), order = ?order, "Stopping containers");

        for name in order {
            match self.stop_container(&name).await {
                Ok(step) => {
                    info!(container = %name, step = ?step, "Container stopped");
                    report.stopped.push((name, step));
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "Container did not stop");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report.still_running = self.compose.ps(directory).await?;
        if !report.is_quiesced() {
            warn!(
                project = %directory.display(),
                failed = report.failed.len(),
                still_running = ?report.still_running,
                "Project not safely quiesced"
            );
        }

        Ok(report)
    }

    /// Escalation for one container: graceful, SIGTERM, SIGKILL.
    pub async fn stop_container(&self, name: &str) -> Result<StopStep> {
        match self.runtime.stop(name, self.settings.graceful_timeout).await {
            Ok(()) => {
                if self.wait_stopped(name, self.settings.poll_interval).await? {
                    return Ok(StopStep::Graceful);
                }
            }
            Err(e) => warn!(container = %name, error = %e, "Graceful stop failed"),
        }

        let escalation = [
            (Signal::SIGTERM, self.settings.sigterm_wait, StopStep::Sigterm),
            (Signal::SIGKILL, self.settings.sigkill_wait, StopStep::Sigkill),
        ];
        for (signal, wait, step) in escalation {
            warn!(container = %name, signal = signal.as_str(), "Escalating stop");
            if let Err(e) = self.runtime.kill(name, signal).await {
                warn!(container = %name, error = %e, "Sending {} failed", signal.as_str());
            }
            if self.wait_stopped(name, wait).await? {
                return Ok(step);
            }
        }

        Err(VaultError::ContainerUnkillable(name.to_string()))
    }

    /// Polls until the container is no longer running or `wait` elapses.
    async fn wait_stopped(&self, name: &str, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;
        loop {
            match self.runtime.inspect(name).await? {
                None => return Ok(true),
                Some(state) if !state.running => return Ok(true),
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn collect_hints(&self, names: &[String]) -> Result<Vec<StopHint>> {
        let mut states = Vec::with_capacity(names.len());
        for name in names {
            if let Some(state) = self.runtime.inspect(name).await? {
                states.push(state);
            }
        }

        let by_service: HashMap<String, String> = states
            .iter()
            .filter_map(|s| s.service().map(|svc| (svc.to_string(), s.name.clone())))
            .collect();

        Ok(states
            .iter()
            .map(|s| {
                let mut depends_on: BTreeSet<String> = s.links.iter().cloned().collect();
                depends_on.extend(
                    s.depends_on_services()
                        .iter()
                        .filter_map(|svc| by_service.get(svc).cloned()),
                );
                depends_on.remove(&s.name);
                StopHint {
                    name: s.name.clone(),
                    depends_on,
                }
            })
            .collect())
    }
}

/// Number of containers in the set depending on each container.
fn dependent_counts(hints: &[StopHint]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = hints.iter().map(|h| (h.name.clone(), 0)).collect();
    for hint in hints {
        for dep in &hint.depends_on {
            if let Some(count) = counts.get_mut(dep) {
                *count += 1;
            }
        }
    }
    counts
}

/// Containers with no dependents first, then the remainder, each group by name.
fn heuristic_order(hints: &[StopHint]) -> Vec<String> {
    let counts = dependent_counts(hints);
    let (first, rest): (Vec<_>, Vec<_>) = counts.into_iter().partition(|(_, n)| *n == 0);
    first.into_iter().chain(rest).map(|(name, _)| name).collect()
}

/// Kahn's algorithm, dependents before their dependencies. Containers left
/// on a cycle are appended in heuristic order.
fn topological_order(hints: &[StopHint]) -> Vec<String> {
    let mut counts = dependent_counts(hints);
    let deps: HashMap<&str, &BTreeSet<String>> =
        hints.iter().map(|h| (h.name.as_str(), &h.depends_on)).collect();

    let mut order = Vec::with_capacity(hints.len());
    let mut ready: BTreeSet<String> = counts
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(name, _)| name.clone())
        .collect();

    while let Some(name) = ready.pop_first() {
        counts.remove(&name);
        if let Some(targets) = deps.get(name.as_str()) {
            for dep in targets.iter() {
                if let Some(count) = counts.get_mut(dep) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dep.clone());
                    }
                }
            }
        }
        order.push(name);
    }

    if !counts.is_empty() {
        warn!(cycle = ?counts.keys().collect::<Vec<_>>(), "Dependency cycle, falling back to heuristic order");
        let remaining: Vec<StopHint> = hints
            .iter()
            .filter(|h| counts.contains_key(&h.name))
            .cloned()
            .collect();
        order.extend(heuristic_order(&remaining));
    }

    order
}
