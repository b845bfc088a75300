//! Service directory discovery.
//!
//! A service directory is an immediate subdirectory of the services root
//! holding a compose manifest. Its directory name is the compose project
//! name unless the containers say otherwise.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::utils::errors::{Result, VaultError};

/// Manifest names `docker compose` looks for, in its order of preference.
pub const COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yml",
    "docker-compose.yaml",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDirectory {
    pub name: String,
    pub path: PathBuf,
    pub manifest: PathBuf,
}

pub fn compose_manifest(dir: &Path) -> Option<PathBuf> {
    COMPOSE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// All service directories below `services_root`, sorted by name.
pub fn discover(services_root: &Path) -> Result<Vec<ServiceDirectory>> {
    let entries = fs::read_dir(services_root).map_err(|e| {
        VaultError::DirectoryUnavailable(format!("{}: {}", services_root.display(), e))
    })?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(manifest) = compose_manifest(&path) else {
            debug!("Skipping {} (no compose manifest)", path.display());
            continue;
        };
        found.push(ServiceDirectory {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            manifest,
        });
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// The single service directory named `project`.
///
/// Compose lowercases project names, so the match ignores ASCII case; more
/// than one candidate is as unresolvable as none.
pub fn find_project(services_root: &Path, project: &str) -> Result<ServiceDirectory> {
    let mut matches: Vec<ServiceDirectory> = discover(services_root)?
        .into_iter()
        .filter(|d| d.name.eq_ignore_ascii_case(project))
        .collect();

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(VaultError::UnresolvableProject(format!(
            "{}: no directory under {}",
            project,
            services_root.display()
        ))),
        n => Err(VaultError::UnresolvableProject(format!(
            "{}: {} candidate directories",
            project, n
        ))),
    }
}
