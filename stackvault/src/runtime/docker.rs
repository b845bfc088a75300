//! Docker Engine adapter for [`ContainerRuntime`].

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerInspectResponse, HealthStatusEnum};
use bollard::Docker;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::time::Duration;

use super::{ContainerFilter, ContainerRuntime, ContainerState, HealthStatus};
use crate::utils::errors::{Result, VaultError};

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            VaultError::ToolMissing(format!("cannot connect to Docker daemon: {}", e))
        })?;
        Ok(Self { docker })
    }
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 404, .. })
}

/// Docker answers 304 when the container is already stopped.
fn is_not_modified(err: &BollardError) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code: 304, .. })
}

fn health_from(status: Option<HealthStatusEnum>) -> HealthStatus {
    match status {
        Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
        Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
        _ => HealthStatus::None,
    }
}

/// `/db:/web/db` names the container `db`.
fn link_target(link: &str) -> Option<String> {
    link.split(':')
        .next()
        .map(|s| s.trim_start_matches('/').to_string())
        .filter(|s| !s.is_empty())
}

fn state_from_inspect(resp: ContainerInspectResponse) -> Result<ContainerState> {
    let raw = serde_json::to_value(&resp)?;
    let status = raw
        .pointer("/State/Status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let state = resp.state.unwrap_or_default();
    let health = health_from(state.health.and_then(|h| h.status));
    let config = resp.config.unwrap_or_default();
    let probe_declared = config
        .healthcheck
        .and_then(|h| h.test)
        .map(|test| !test.is_empty() && test[0] != "NONE")
        .unwrap_or(false);

    let mut networks: Vec<String> = resp
        .network_settings
        .and_then(|n| n.networks)
        .map(|n| n.into_keys().collect())
        .unwrap_or_default();
    networks.sort();

    let links = resp
        .host_config
        .and_then(|h| h.links)
        .unwrap_or_default()
        .iter()
        .filter_map(|l| link_target(l))
        .collect();

    Ok(ContainerState {
        id: resp.id.unwrap_or_default(),
        name: resp
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        running: state.running.unwrap_or(false),
        pid: state.pid.unwrap_or(0),
        status,
        has_probe: probe_declared || health != HealthStatus::None,
        health,
        labels: config.labels.unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        networks,
        links,
        raw,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| VaultError::ToolMissing(format!("Docker daemon not responding: {}", e)))?;
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<Option<ContainerState>> {
        match self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(resp) => state_from_inspect(resp).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, container: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) || is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn kill(&self, container: &str, signal: Signal) -> Result<()> {
        let options = KillContainerOptions {
            signal: signal.as_str(),
        };
        match self.docker.kill_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<String>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !filter.labels.is_empty() {
            filters.insert(
                "label".to_string(),
                filter
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            );
        }
        let status = filter.status.clone().unwrap_or_else(|| "running".to_string());
        filters.insert("status".to_string(), vec![status]);

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self.docker.list_containers(options).await?;
        let mut names: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|n| n.into_iter().next()))
            .map(|n| n.trim_start_matches('/').to_string())
            .collect();
        names.sort();
        Ok(names)
    }
}
