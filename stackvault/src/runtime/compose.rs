//! `docker compose` CLI adapter for [`ComposeRuntime`].

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::ComposeRuntime;
use crate::utils::errors::{Result, VaultError};

#[derive(Debug, Clone)]
pub struct DockerCompose {
    program: String,
}

impl Default for DockerCompose {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCompose {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute a compose sub-command inside `project_dir`
    async fn compose_command(&self, project_dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("compose")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = project_dir {
            cmd.current_dir(dir);
        }

        debug!("Running {} compose {}", self.program, args.join(" "));
        let output = cmd.output().await.map_err(|e| {
            VaultError::ToolMissing(format!("failed to execute {} compose: {}", self.program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VaultError::Compose(format!(
                "compose {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl ComposeRuntime for DockerCompose {
    async fn version(&self) -> Result<String> {
        let out = self.compose_command(None, &["version", "--short"]).await?;
        Ok(out.trim().to_string())
    }

    async fn up(&self, project_dir: &Path, service: Option<&str>) -> Result<()> {
        let mut args = vec!["up", "-d"];
        args.extend(service);
        self.compose_command(Some(project_dir), &args).await?;
        Ok(())
    }

    async fn down(&self, project_dir: &Path, remove_orphans: bool) -> Result<()> {
        let mut args = vec!["down"];
        if remove_orphans {
            args.push("--remove-orphans");
        }
        self.compose_command(Some(project_dir), &args).await?;
        Ok(())
    }

    async fn pull(&self, project_dir: &Path, service: Option<&str>) -> Result<()> {
        let mut args = vec!["pull", "--quiet"];
        args.extend(service);
        self.compose_command(Some(project_dir), &args).await?;
        Ok(())
    }

    async fn ps(&self, project_dir: &Path) -> Result<Vec<String>> {
        let out = self
            .compose_command(Some(project_dir), &["ps", "--format", "{{.Name}}"])
            .await?;
        Ok(parse_lines(&out))
    }
}
