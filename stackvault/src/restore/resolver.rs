//! Restore chain resolver.
//!
//! Picks the most recent full backup at or before the target and every
//! incremental between it and the target, then checks that the members form
//! one unbroken lineage and that every archive decodes. Any doubt is an error:
//! a chain is either fully trusted or not returned at all.

use std::path::PathBuf;
use tracing::{debug, info};

use crate::archive::{self, BackupKind};
use crate::store::{BackupSet, SnapshotStore};
use crate::utils::errors::{Result, VaultError};
use crate::utils::timestamp::BackupTimestamp;

/// Ordered chain from a full backup up to the requested point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupChain {
    pub store_root: PathBuf,
    pub target: BackupTimestamp,
    pub members: Vec<BackupSet>,
}

impl BackupChain {
    pub fn root(&self) -> &BackupSet {
        &self.members[0]
    }

    /// Latest member; the point in time the chain restores to.
    pub fn tip(&self) -> &BackupSet {
        &self.members[self.members.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Resolve the chain restoring `store` to its state at `target`.
///
/// Blocking: every member is fully decoded.
pub fn resolve_chain(store: &SnapshotStore, target: BackupTimestamp) -> Result<BackupChain> {
    // Ties sort by file name, so the lexicographically later name wins
    let root = store.latest_full(target)?.ok_or_else(|| {
        VaultError::NoFullBackup(format!("{} at or before {}", store.root().display(), target))
    })?;
    let increments: Vec<_> = store
        .list()?
        .into_iter()
        .filter(|s| s.kind == BackupKind::Incremental && s.timestamp > root.timestamp && s.timestamp <= target)
        .collect();

    let selected = std::iter::once(&root).chain(increments.iter());

    let mut members: Vec<BackupSet> = Vec::new();
    for entry in selected {
        let header = archive::verify_archive(&entry.archive_path).map_err(|e| match e {
            VaultError::ArchiveCorrupt(_) => e,
            other => VaultError::ArchiveCorrupt(format!("{}: {}", entry.file_name, other)),
        })?;
        let set = BackupSet::from_header(entry, &header);

        if header.kind != entry.kind || header.timestamp != entry.timestamp {
            return Err(VaultError::ChainBroken(format!(
                "{} header does not match its name",
                entry.file_name
            )));
        }

        if let Some(previous) = members.last() {
            if set.marker_version != members[0].marker_version {
                return Err(VaultError::ChainBroken(format!(
                    "{} belongs to a different lineage than {}",
                    entry.file_name,
                    members[0].archive_path.display()
                )));
            }
            if set.parent != Some(previous.timestamp) {
                return Err(VaultError::ChainBroken(format!(
                    "{} follows {} but the chain has {}",
                    entry.file_name,
                    set.parent.map(|p| p.to_string()).unwrap_or_else(|| "nothing".into()),
                    previous.timestamp
                )));
            }
        }

        debug!("Chain member {} verified", entry.file_name);
        members.push(set);
    }

    info!(
        store = %store.root().display(),
        "Resolved chain for {}: {} member(s) from {}",
        target,
        members.len(),
        members[0].timestamp
    );

    Ok(BackupChain {
        store_root: store.root().to_path_buf(),
        target,
        members,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{write_archive, ArchiveHeader, CompressionOptions};
    use crate::backup::ChainBuilder;
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn ts(raw: &str) -> BackupTimestamp {
        raw.parse().unwrap()
    }

    const D1: &str = "20240101_020000";
    const D2: &str = "20240102_020000";
    const D3: &str = "20240103_020000";

    fn builder() -> ChainBuilder {
        ChainBuilder::new(
            chrono::Duration::days(7),
            CompressionOptions { level: 1, workers: 1 },
            Vec::new(),
        )
    }

    /// Full@D1, Incr@D2, Incr@D3
    fn three_day_chain() -> (TempDir, PathBuf, SnapshotStore) {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        let store = SnapshotStore::open(dir.path().join("store")).unwrap();
        let b = builder();

        fs::write(source.join("a.txt"), b"one").unwrap();
        b.create_backup(&source, &store, ts(D1)).unwrap();
        fs::write(source.join("b.txt"), b"two").unwrap();
        b.create_backup(&source, &store, ts(D2)).unwrap();
        fs::write(source.join("c.txt"), b"three").unwrap();
        b.create_backup(&source, &store, ts(D3)).unwrap();

        (dir, source, store)
    }

    fn timestamps(chain: &BackupChain) -> Vec<String> {
        chain.members.iter().map(|m| m.timestamp.to_string()).collect()
    }

    #[test]
    fn test_resolves_full_and_incrementals() -> Result<()> {
        let (_dir, _source, store) = three_day_chain();

        let chain = resolve_chain(&store, ts(D3))?;
        assert_eq!(timestamps(&chain), vec![D1, D2, D3]);
        assert_eq!(chain.root().kind, BackupKind::Full);
        assert_eq!(chain.tip().timestamp, ts(D3));

        let partial = resolve_chain(&store, ts("20240102_230000"))?;
        assert_eq!(timestamps(&partial), vec![D1, D2]);
        Ok(())
    }

    #[test]
    fn test_resolution_is_idempotent() -> Result<()> {
        let (_dir, _source, store) = three_day_chain();
        assert_eq!(resolve_chain(&store, ts(D3))?, resolve_chain(&store, ts(D3))?);
        Ok(())
    }

    #[test]
    fn test_missing_middle_incremental_is_broken() -> Result<()> {
        let (_dir, _source, store) = three_day_chain();
        fs::remove_file(store.archive_path(BackupKind::Incremental, ts(D2)))?;

        let result = resolve_chain(&store, ts(D3));
        assert!(matches!(result, Err(VaultError::ChainBroken(_))));
        Ok(())
    }

    #[test]
    fn test_no_full_before_target() -> Result<()> {
        let (_dir, _source, store) = three_day_chain();
        let result = resolve_chain(&store, ts("20231231_000000"));
        assert!(matches!(result, Err(VaultError::NoFullBackup(_))));
        Ok(())
    }

    #[test]
    fn test_corrupt_member_fails_closed() -> Result<()> {
        let (_dir, _source, store) = three_day_chain();
        let path = store.archive_path(BackupKind::Incremental, ts(D3));
        let bytes = fs::read(&path)?;
        fs::write(&path, &bytes[..bytes.len() / 2])?;

        assert!(matches!(resolve_chain(&store, ts(D3)), Err(VaultError::ArchiveCorrupt(_))));
        // Earlier targets do not depend on the damaged member
        assert_eq!(resolve_chain(&store, ts(D2))?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_foreign_lineage_is_broken() -> Result<()> {
        let (_dir, source, store) = three_day_chain();
        let stray = ArchiveHeader {
            format: crate::archive::header::FORMAT_VERSION,
            kind: BackupKind::Incremental,
            timestamp: ts("20240104_020000"),
            parent: Some(ts(D3)),
            marker_version: Uuid::new_v4(),
            source_root: source.clone(),
            stored_entries: 0,
            listing: Vec::new(),
        };
        write_archive(
            &store.archive_path(BackupKind::Incremental, stray.timestamp),
            &source,
            &stray,
            &[],
            CompressionOptions { level: 1, workers: 1 },
        )?;

        let result = resolve_chain(&store, ts("20240104_020000"));
        assert!(matches!(result, Err(VaultError::ChainBroken(_))));
        Ok(())
    }

    #[test]
    fn test_newer_full_starts_new_chain() -> Result<()> {
        let (_dir, source, store) = three_day_chain();
        // A stale marker forces a full eight days later
        builder().create_backup(&source, &store, ts("20240111_020000"))?;

        let chain = resolve_chain(&store, ts("20240111_020000"))?;
        assert_eq!(timestamps(&chain), vec!["20240111_020000"]);
        Ok(())
    }
}
