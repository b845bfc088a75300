//! Backup chain builder.
//!
//! Produces one archive per call: a full backup when the snapshot marker
//! cannot be trusted, otherwise an incremental holding only the entries that
//! changed since the previous chain member. Archives are written under a
//! `.partial` name, self-tested, then renamed into the store. The marker is
//! only persisted once the archive is committed.

pub mod retention;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::archive::{
    self, write_archive, ArchiveHeader, BackupKind, CompressionOptions, ListingEntry,
};
use crate::config::BackupConfig;
use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::store::{BackupSet, MarkerState, SetEntry, SnapshotMarker, SnapshotStore};
use crate::utils::errors::{Result, VaultError};
use crate::utils::timestamp::BackupTimestamp;

pub use retention::{prune, PruneReport};

/// Why a full backup was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullReason {
    NoMarker,
    CorruptMarker(String),
    StaleMarker(BackupTimestamp),
    /// No full backup in the window carries the marker's version
    NoMatchingFull,
    /// The archive the next incremental would build on is gone
    MissingChainTip(BackupTimestamp),
}

impl std::fmt::Display for FullReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FullReason::NoMarker => write!(f, "no snapshot marker"),
            FullReason::CorruptMarker(e) => write!(f, "snapshot marker unreadable ({})", e),
            FullReason::StaleMarker(ts) => write!(f, "snapshot marker from {} is stale", ts),
            FullReason::NoMatchingFull => write!(f, "no full backup matches the marker"),
            FullReason::MissingChainTip(ts) => write!(f, "chain member {} is missing", ts),
        }
    }
}

/// Outcome of the full/incremental decision.
#[derive(Debug)]
pub enum BackupPlan {
    Full(FullReason),
    Incremental(SnapshotMarker),
}

/// Result of a committed backup
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub set: BackupSet,
    /// Entries stored in the archive body
    pub stored_entries: usize,
    /// Entries present in the tree
    pub listed_entries: usize,
    pub archive_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ChainBuilder {
    staleness: chrono::Duration,
    compression: CompressionOptions,
    excludes: Vec<String>,
}

impl ChainBuilder {
    pub fn new(staleness: chrono::Duration, compression: CompressionOptions, excludes: Vec<String>) -> Self {
        Self {
            staleness,
            compression,
            excludes,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(
            config.staleness(),
            CompressionOptions::from_cpu_fraction(config.compression_level, config.cpu_fraction),
            config.exclude_patterns.clone(),
        )
    }

    /// Decide between a full and an incremental backup at `now`.
    pub fn plan(&self, store: &SnapshotStore, now: BackupTimestamp) -> Result<BackupPlan> {
        let marker = match store.load_marker() {
            MarkerState::Absent => return Ok(BackupPlan::Full(FullReason::NoMarker)),
            MarkerState::Corrupt(e) => return Ok(BackupPlan::Full(FullReason::CorruptMarker(e))),
            MarkerState::Present(marker) => marker,
        };

        if marker.is_stale(now, self.staleness) {
            return Ok(BackupPlan::Full(FullReason::StaleMarker(marker.full_timestamp)));
        }

        let sets = store.list()?;
        if !self.has_matching_full(store, &sets, &marker, now) {
            return Ok(BackupPlan::Full(FullReason::NoMatchingFull));
        }

        let tip_present = sets.iter().any(|s| s.timestamp == marker.last_backup);
        if !tip_present {
            return Ok(BackupPlan::Full(FullReason::MissingChainTip(marker.last_backup)));
        }

        Ok(BackupPlan::Incremental(marker))
    }

    fn has_matching_full(
        &self,
        store: &SnapshotStore,
        sets: &[SetEntry],
        marker: &SnapshotMarker,
        now: BackupTimestamp,
    ) -> bool {
        let window_start = now.minus(self.staleness);
        sets.iter()
            .rev()
            .filter(|s| s.kind == BackupKind::Full && s.timestamp >= window_start && s.timestamp <= now)
            .any(|s| match store.describe(s) {
                Ok(set) => set.marker_version == marker.version,
                Err(e) => {
                    warn!("Cannot read header of {}: {}", s.file_name, e);
                    false
                }
            })
    }

    /// Build and commit one backup set of `source_root` at `timestamp`.
    ///
    /// Blocking; callers on the runtime wrap it in `spawn_blocking`.
    pub fn create_backup(
        &self,
        source_root: &Path,
        store: &SnapshotStore,
        timestamp: BackupTimestamp,
    ) -> Result<BackupReport> {
        if !source_root.is_dir() {
            return Err(VaultError::DirectoryUnavailable(source_root.display().to_string()));
        }

        let scanned = walk_directory(source_root, WalkOptions::with_excludes(self.excludes.clone()))
            .map_err(|e| VaultError::DirectoryUnavailable(format!("{}: {}", source_root.display(), e)))?;

        let plan = self.plan(store, timestamp)?;
        let (kind, marker, parent, stored) = match plan {
            BackupPlan::Full(reason) => {
                info!(source = %source_root.display(), "Full backup: {}", reason);
                let marker = SnapshotMarker::reset(&scanned, timestamp);
                (BackupKind::Full, marker, None, scanned.clone())
            }
            BackupPlan::Incremental(mut marker) => {
                let diff = marker.diff(&scanned);
                info!(
                    source = %source_root.display(),
                    "Incremental backup: {} changed, {} unchanged, {} deleted",
                    diff.changed.len(),
                    diff.unchanged_count,
                    diff.deleted_count
                );
                let parent = marker.last_backup;
                if parent >= timestamp {
                    return Err(VaultError::ChainBroken(format!(
                        "backup at {} does not follow chain tip {}",
                        timestamp, parent
                    )));
                }
                marker.advance(&scanned, timestamp);
                (BackupKind::Incremental, marker, Some(parent), diff.changed)
            }
        };

        let header = ArchiveHeader {
            format: archive::header::FORMAT_VERSION,
            kind,
            timestamp,
            parent,
            marker_version: marker.version,
            source_root: source_root.to_path_buf(),
            stored_entries: stored.len(),
            listing: listing_of(&scanned),
        };

        let dest = store.archive_path(kind, timestamp);
        if dest.exists() {
            return Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", dest.display()),
            )));
        }

        let partial = partial_path(&dest);
        if let Err(e) = write_archive(&partial, source_root, &header, &stored, self.compression) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        commit_archive(&partial, &dest)?;
        let archive_bytes = fs::metadata(&dest)?.len();

        store.save_marker(&marker)?;

        let entry = SetEntry {
            timestamp,
            kind,
            archive_path: dest.clone(),
            file_name: SnapshotStore::archive_name(kind, timestamp),
        };
        info!(
            "Committed {} ({} of {} entries, {} bytes)",
            entry.file_name,
            stored.len(),
            scanned.len(),
            archive_bytes
        );

        Ok(BackupReport {
            set: BackupSet::from_header(&entry, &header),
            stored_entries: stored.len(),
            listed_entries: scanned.len(),
            archive_bytes,
        })
    }
}

fn listing_of(scanned: &[FileInfo]) -> Vec<ListingEntry> {
    scanned
        .iter()
        .map(|e| ListingEntry {
            path: e.key(),
            kind: e.kind,
        })
        .collect()
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Self-test `partial` and rename it to `dest`; a failing archive is deleted.
fn commit_archive(partial: &Path, dest: &Path) -> Result<ArchiveHeader> {
    match archive::verify_archive(partial) {
        Ok(header) => {
            fs::rename(partial, dest)?;
            Ok(header)
        }
        Err(e) => {
            warn!("Discarding {}: {}", partial.display(), e);
            let _ = fs::remove_file(partial);
            match e {
                VaultError::ArchiveCorrupt(_) => Err(e),
                other => Err(VaultError::ArchiveCorrupt(other.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::read_header;
    use tempfile::TempDir;

    fn ts(raw: &str) -> BackupTimestamp {
        raw.parse().unwrap()
    }

    fn builder() -> ChainBuilder {
        ChainBuilder::new(
            chrono::Duration::days(7),
            CompressionOptions { level: 3, workers: 1 },
            vec![".git".to_string()],
        )
    }

    fn setup() -> (TempDir, PathBuf, SnapshotStore) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("project");
        fs::create_dir_all(source.join("data")).unwrap();
        fs::write(source.join("compose.yaml"), b"services: {}\n").unwrap();
        fs::write(source.join("data/app.db"), b"v1").unwrap();
        let store = SnapshotStore::open(dir.path().join("store")).unwrap();
        (dir, source, store)
    }

    #[test]
    fn test_first_backup_is_full() -> Result<()> {
        let (_dir, source, store) = setup();
        let report = builder().create_backup(&source, &store, ts("20240101_020000"))?;

        assert_eq!(report.set.kind, BackupKind::Full);
        assert_eq!(report.stored_entries, report.listed_entries);
        assert!(report.set.parent.is_none());
        assert!(matches!(store.load_marker(), MarkerState::Present(_)));
        Ok(())
    }

    #[test]
    fn test_incremental_stores_only_changes_and_keeps_version() -> Result<()> {
        let (_dir, source, store) = setup();
        let b = builder();
        let full = b.create_backup(&source, &store, ts("20240101_020000"))?;

        fs::write(source.join("data/app.db"), b"version two")?;
        fs::write(source.join("data/new.log"), b"hello")?;
        let incr = b.create_backup(&source, &store, ts("20240102_020000"))?;

        assert_eq!(incr.set.kind, BackupKind::Incremental);
        assert_eq!(incr.set.marker_version, full.set.marker_version);
        assert_eq!(incr.set.parent, Some(ts("20240101_020000")));

        let header = read_header(&incr.set.archive_path)?;
        let listed: Vec<&str> = header.listing.iter().map(|e| e.path.as_str()).collect();
        assert!(listed.contains(&"compose.yaml"));
        assert!(incr.stored_entries < incr.listed_entries);

        let incr2 = b.create_backup(&source, &store, ts("20240103_020000"))?;
        assert_eq!(incr2.set.marker_version, full.set.marker_version);
        assert_eq!(incr2.set.parent, Some(ts("20240102_020000")));
        Ok(())
    }

    #[test]
    fn test_stale_marker_forces_full() -> Result<()> {
        let (_dir, source, store) = setup();
        let b = builder();
        let first = b.create_backup(&source, &store, ts("20240101_020000"))?;

        let plan = b.plan(&store, ts("20240109_020000"))?;
        assert!(matches!(plan, BackupPlan::Full(FullReason::StaleMarker(_))));

        let second = b.create_backup(&source, &store, ts("20240109_020000"))?;
        assert_eq!(second.set.kind, BackupKind::Full);
        assert_ne!(second.set.marker_version, first.set.marker_version);
        Ok(())
    }

    #[test]
    fn test_corrupt_marker_forces_full() -> Result<()> {
        let (_dir, source, store) = setup();
        let b = builder();
        b.create_backup(&source, &store, ts("20240101_020000"))?;
        fs::write(store.marker_path(), b"garbage")?;

        let report = b.create_backup(&source, &store, ts("20240102_020000"))?;
        assert_eq!(report.set.kind, BackupKind::Full);
        Ok(())
    }

    #[test]
    fn test_missing_full_forces_full() -> Result<()> {
        let (_dir, source, store) = setup();
        let b = builder();
        b.create_backup(&source, &store, ts("20240101_020000"))?;
        for entry in store.list()? {
            store.delete(&entry)?;
        }

        let plan = b.plan(&store, ts("20240102_020000"))?;
        assert!(matches!(plan, BackupPlan::Full(FullReason::NoMatchingFull)));
        Ok(())
    }

    #[test]
    fn test_missing_directory() {
        let (dir, _source, store) = setup();
        let result = builder().create_backup(&dir.path().join("nope"), &store, ts("20240101_020000"));
        assert!(matches!(result, Err(VaultError::DirectoryUnavailable(_))));
    }

    #[test]
    fn test_corrupt_archive_is_discarded() -> Result<()> {
        let dir = TempDir::new()?;
        let dest = dir.path().join("full_20240101_020000.tar.zst");
        let partial = partial_path(&dest);
        fs::write(&partial, b"not an archive")?;

        let result = commit_archive(&partial, &dest);
        assert!(matches!(result, Err(VaultError::ArchiveCorrupt(_))));
        assert!(!partial.exists());
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn test_marker_untouched_when_backup_fails() -> Result<()> {
        let (_dir, source, store) = setup();
        let b = builder();
        b.create_backup(&source, &store, ts("20240101_020000"))?;
        let before = fs::read(store.marker_path())?;

        // A timestamp that does not follow the chain tip is refused
        assert!(b.create_backup(&source, &store, ts("20240101_020000")).is_err());
        assert_eq!(fs::read(store.marker_path())?, before);
        Ok(())
    }
}
