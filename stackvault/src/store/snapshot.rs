//! Snapshot store: the archives and marker of one project.
//!
//! Layout under the project's backup root:
//!
//! ```text
//! full_20240101_020000.tar.zst
//! incr_20240102_020000.tar.zst
//! snapshot.marker
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::marker::{MarkerState, SnapshotMarker, MARKER_FILE};
use crate::archive::{self, ArchiveHeader, BackupKind, ARCHIVE_EXTENSION};
use crate::utils::errors::{Result, VaultError};
use crate::utils::timestamp::BackupTimestamp;

/// An archive found in the store, identified by its file name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEntry {
    pub timestamp: BackupTimestamp,
    pub kind: BackupKind,
    pub archive_path: PathBuf,
    pub file_name: String,
}

impl SetEntry {
    /// Chronological order; equal timestamps fall back to the file name so
    /// the lexicographically later name counts as more recent.
    fn sort_key(&self) -> (BackupTimestamp, &str) {
        (self.timestamp, self.file_name.as_str())
    }
}

/// A backup set with the details recorded in its archive header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    pub timestamp: BackupTimestamp,
    pub kind: BackupKind,
    pub archive_path: PathBuf,
    pub source_root: PathBuf,
    pub marker_version: Uuid,
    pub parent: Option<BackupTimestamp>,
}

impl BackupSet {
    pub fn from_header(entry: &SetEntry, header: &ArchiveHeader) -> Self {
        Self {
            timestamp: entry.timestamp,
            kind: entry.kind,
            archive_path: entry.archive_path.clone(),
            source_root: header.source_root.clone(),
            marker_version: header.marker_version,
            parent: header.parent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            VaultError::DirectoryUnavailable(format!("{}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    pub fn load_marker(&self) -> MarkerState {
        SnapshotMarker::load(&self.marker_path())
    }

    pub fn save_marker(&self, marker: &SnapshotMarker) -> Result<()> {
        marker.save(&self.marker_path())
    }

    pub fn archive_name(kind: BackupKind, timestamp: BackupTimestamp) -> String {
        format!("{}_{}.{}", kind.prefix(), timestamp, ARCHIVE_EXTENSION)
    }

    pub fn archive_path(&self, kind: BackupKind, timestamp: BackupTimestamp) -> PathBuf {
        self.root.join(Self::archive_name(kind, timestamp))
    }

    /// All archives in chronological order.
    pub fn list(&self) -> Result<Vec<SetEntry>> {
        let mut sets = Vec::new();
        let suffix = format!(".{}", ARCHIVE_EXTENSION);

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = file_name.strip_suffix(&suffix) else {
                continue;
            };
            let parsed = BackupTimestamp::split_suffix(stem)
                .and_then(|(prefix, ts)| BackupKind::from_prefix(prefix).map(|kind| (kind, ts)));
            match parsed {
                Some((kind, timestamp)) => sets.push(SetEntry {
                    timestamp,
                    kind,
                    archive_path: entry.path(),
                    file_name,
                }),
                None => debug!("Ignoring unrecognised file in store: {}", file_name),
            }
        }

        sets.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(sets)
    }

    /// Most recent full backup at or before `at`.
    pub fn latest_full(&self, at: BackupTimestamp) -> Result<Option<SetEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.kind == BackupKind::Full && s.timestamp <= at)
            .last())
    }

    /// Read an entry's header (without a full integrity pass).
    pub fn describe(&self, entry: &SetEntry) -> Result<BackupSet> {
        let header = archive::read_header(&entry.archive_path)?;
        Ok(BackupSet::from_header(entry, &header))
    }

    pub fn delete(&self, entry: &SetEntry) -> Result<()> {
        fs::remove_file(&entry.archive_path)?;
        info!("Deleted backup set {}", entry.file_name);
        Ok(())
    }
}

/// Root directory holding one snapshot store per project.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    backup_root: PathBuf,
}

impl StoreLayout {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
        }
    }

    pub fn project(&self, name: &str) -> Result<SnapshotStore> {
        SnapshotStore::open(self.backup_root.join(name))
    }

    /// Names of projects that have at least one archive.
    pub fn projects(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let store = SnapshotStore { root: entry.path() };
            if !store.list()?.is_empty() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
