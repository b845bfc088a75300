//! Snapshot marker: change-tracking state for incremental backups.
//!
//! The marker records every entry of the tree with its size and mtime,
//! allowing the builder to diff against it and only archive changed entries.
//! Its `version` names the lineage started by a full backup; incrementals
//! advance the entries but never change the version.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

use crate::fs::walker::{EntryKind, FileInfo};
use crate::utils::errors::Result;
use crate::utils::timestamp::BackupTimestamp;

/// File name of the marker inside a project's backup root.
pub const MARKER_FILE: &str = "snapshot.marker";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMarker {
    pub version: Uuid,
    /// Timestamp of the full backup that reset this marker.
    pub full_timestamp: BackupTimestamp,
    /// Timestamp of the latest chain member built against this marker.
    pub last_backup: BackupTimestamp,
    pub entries: HashMap<String, MarkerEntry>,
}

/// Metadata for a single entry in the marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerEntry {
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    #[serde(default)]
    pub mtime_nsec: i64,
}

impl From<&FileInfo> for MarkerEntry {
    fn from(info: &FileInfo) -> Self {
        Self {
            kind: info.kind,
            size: info.size,
            mtime: info.mtime,
            mtime_nsec: info.mtime_nsec,
        }
    }
}

/// What was found on disk where the marker should be.
#[derive(Debug)]
pub enum MarkerState {
    Absent,
    Corrupt(String),
    Present(SnapshotMarker),
}

/// Result of diffing scanned entries against a marker
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Entries to archive (new or modified)
    pub changed: Vec<FileInfo>,
    pub unchanged_count: usize,
    /// Entries in the marker but no longer on disk
    pub deleted_count: usize,
}

impl SnapshotMarker {
    /// A fresh marker for a full backup at `timestamp`.
    pub fn reset(entries: &[FileInfo], timestamp: BackupTimestamp) -> Self {
        Self {
            version: Uuid::new_v4(),
            full_timestamp: timestamp,
            last_backup: timestamp,
            entries: entries.iter().map(|e| (e.key(), MarkerEntry::from(e))).collect(),
        }
    }

    pub fn load(path: &Path) -> MarkerState {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MarkerState::Absent,
            Err(e) => return MarkerState::Corrupt(e.to_string()),
        };
        match serde_json::from_slice(&raw) {
            Ok(marker) => MarkerState::Present(marker),
            Err(e) => {
                warn!("Snapshot marker {} is unreadable: {}", path.display(), e);
                MarkerState::Corrupt(e.to_string())
            }
        }
    }

    /// Writes through a temporary file and renames it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("marker.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn is_stale(&self, now: BackupTimestamp, window: Duration) -> bool {
        self.full_timestamp.older_than(now, window)
    }

    /// Compare scanned entries against the marker to determine what changed.
    /// Uses size + mtime as the change detection heuristic (same as rsync default).
    pub fn diff(&self, scanned: &[FileInfo]) -> DiffResult {
        let mut result = DiffResult::default();
        let mut seen = HashSet::with_capacity(scanned.len());

        for info in scanned {
            let key = info.key();
            match self.entries.get(&key) {
                Some(entry) if *entry == MarkerEntry::from(info) => result.unchanged_count += 1,
                _ => result.changed.push(info.clone()),
            }
            seen.insert(key);
        }

        result.deleted_count = self.entries.keys().filter(|k| !seen.contains(*k)).count();
        result
    }

    /// Moves the marker forward to the state captured at `timestamp`.
    pub fn advance(&mut self, scanned: &[FileInfo], timestamp: BackupTimestamp) {
        self.entries = scanned.iter().map(|e| (e.key(), MarkerEntry::from(e))).collect();
        self.last_backup = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn info(path: &str, size: u64, mtime: i64) -> FileInfo {
        FileInfo {
            path: PathBuf::from("/data").join(path),
            relative_path: PathBuf::from(path),
            kind: EntryKind::File,
            size,
            mtime,
            mtime_nsec: 0,
            depth: 1,
        }
    }

    fn ts(raw: &str) -> BackupTimestamp {
        raw.parse().unwrap()
    }

    #[test]
    fn test_diff_against_marker() {
        let marker = SnapshotMarker::reset(
            &[info("file1.txt", 100, 1000), info("file2.txt", 200, 2000), info("deleted.txt", 50, 500)],
            ts("20240101_000000"),
        );

        let scanned = vec![
            info("file1.txt", 100, 1000),
            info("file2.txt", 250, 2000),
            info("new_file.txt", 300, 3000),
        ];
        let result = marker.diff(&scanned);

        let changed: Vec<String> = result.changed.iter().map(|f| f.key()).collect();
        assert_eq!(changed, vec!["file2.txt", "new_file.txt"]);
        assert_eq!(result.unchanged_count, 1);
        assert_eq!(result.deleted_count, 1);
    }

    #[test]
    fn test_advance_keeps_version() {
        let mut marker = SnapshotMarker::reset(&[info("a", 1, 1)], ts("20240101_000000"));
        let version = marker.version;

        marker.advance(&[info("a", 2, 2)], ts("20240102_000000"));

        assert_eq!(marker.version, version);
        assert_eq!(marker.last_backup, ts("20240102_000000"));
        assert_eq!(marker.full_timestamp, ts("20240101_000000"));
        assert_eq!(marker.entries["a"].size, 2);
    }

    #[test]
    fn test_staleness_window() {
        let marker = SnapshotMarker::reset(&[], ts("20240101_000000"));
        assert!(!marker.is_stale(ts("20240107_000000"), Duration::days(7)));
        assert!(marker.is_stale(ts("20240108_000001"), Duration::days(7)));
    }

    #[test]
    fn test_load_states() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(MARKER_FILE);
        assert!(matches!(SnapshotMarker::load(&path), MarkerState::Absent));

        fs::write(&path, b"{ not json")?;
        assert!(matches!(SnapshotMarker::load(&path), MarkerState::Corrupt(_)));

        let marker = SnapshotMarker::reset(&[info("a", 1, 1)], ts("20240101_000000"));
        marker.save(&path)?;
        match SnapshotMarker::load(&path) {
            MarkerState::Present(loaded) => assert_eq!(loaded.version, marker.version),
            other => panic!("unexpected marker state: {:?}", other),
        }
        Ok(())
    }
}
