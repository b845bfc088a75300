//! Apply phase: replays a resolved chain onto a project directory.
//!
//! Members are extracted in order into a private staging directory, each
//! one pruning the paths its listing no longer holds. Only once the whole
//! chain is staged does the destination get touched, through a mirror that
//! deletes whatever the staged tree lacks.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::resolver::BackupChain;
use crate::archive;
use crate::fs::loosen_dirs;
use crate::fs::mirror::{mirror, MirrorStats};
use crate::utils::errors::{Result, VaultError};

/// Name prefix of staging directories, used to find leftovers.
pub const STAGING_PREFIX: &str = "restore-";

/// Staging directory removed when dropped.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub fn create(staging_root: &Path) -> Result<Self> {
        let path = staging_root.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        fs::create_dir_all(&path).map_err(|e| {
            VaultError::DirectoryUnavailable(format!("{}: {}", path.display(), e))
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = remove_staging(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove staging directory {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Remove staging directories left behind by an interrupted run.
pub fn clean_staging_root(staging_root: &Path) -> Result<usize> {
    let entries = match fs::read_dir(staging_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
            remove_staging(&entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Staged trees may hold read-only directories.
fn remove_staging(path: &Path) -> std::io::Result<()> {
    loosen_dirs(path)?;
    fs::remove_dir_all(path)
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub members_applied: usize,
    pub mirror: MirrorStats,
}

/// Replay `chain` onto `destination`, staging under `staging_root`.
///
/// Blocking. A failure anywhere before the mirror leaves `destination` as
/// it was.
pub fn apply_chain(
    chain: &BackupChain,
    destination: &Path,
    staging_root: &Path,
    excludes: &[String],
) -> Result<ApplyReport> {
    for member in &chain.members {
        archive::verify_archive(&member.archive_path)?;
    }

    let staging = StagingDir::create(staging_root)?;
    for member in &chain.members {
        debug!("Staging {}", member.archive_path.display());
        archive::extract_archive(&member.archive_path, staging.path())?;
    }

    let stats = mirror(staging.path(), destination, excludes)?;
    info!(
        destination = %destination.display(),
        "Applied {} chain member(s): {} copied, {} unchanged, {} removed",
        chain.len(),
        stats.copied,
        stats.unchanged,
        stats.removed
    );

    Ok(ApplyReport {
        members_applied: chain.len(),
        mirror: stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{BackupKind, CompressionOptions};
    use crate::backup::ChainBuilder;
    use crate::restore::resolver::resolve_chain;
    use crate::store::SnapshotStore;
    use crate::utils::timestamp::BackupTimestamp;
    use sha2::{Digest, Sha256};
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn ts(raw: &str) -> BackupTimestamp {
        raw.parse().unwrap()
    }

    /// Relative path to content hash; directories map to an empty digest.
    fn tree_digest(root: &Path, excludes: &[&str]) -> BTreeMap<String, String> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !excludes.contains(&e.file_name().to_string_lossy().as_ref()))
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
                let digest = if e.file_type().is_file() {
                    format!("{:x}", Sha256::digest(fs::read(e.path()).unwrap()))
                } else {
                    String::new()
                };
                (rel, digest)
            })
            .collect()
    }

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        dest: PathBuf,
        staging: PathBuf,
        store: SnapshotStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        let dest = dir.path().join("dest");
        let staging = dir.path().join("staging");
        fs::create_dir_all(source.join("data/old")).unwrap();
        let store = SnapshotStore::open(dir.path().join("store")).unwrap();
        Fixture {
            _dir: dir,
            source,
            dest,
            staging,
            store,
        }
    }

    fn builder() -> ChainBuilder {
        ChainBuilder::new(
            chrono::Duration::days(7),
            CompressionOptions { level: 1, workers: 1 },
            vec!["cache".to_string()],
        )
    }

    #[test]
    fn test_chain_reproduces_tree_at_tip() -> Result<()> {
        let fx = fixture();
        let b = builder();

        fs::write(fx.source.join("compose.yaml"), b"services:\n  web: {}\n")?;
        fs::write(fx.source.join("data/old/stale.bin"), vec![1u8; 2048])?;
        fs::write(fx.source.join("data/app.db"), b"v1")?;
        b.create_backup(&fx.source, &fx.store, ts("20240101_020000"))?;

        fs::remove_dir_all(fx.source.join("data/old"))?;
        fs::write(fx.source.join("data/app.db"), b"version two")?;
        fs::write(fx.source.join("notes.md"), b"added")?;
        b.create_backup(&fx.source, &fx.store, ts("20240102_020000"))?;

        fs::write(fx.source.join("data/app.db"), b"version three!")?;
        fs::create_dir_all(fx.source.join("cache"))?;
        fs::write(fx.source.join("cache/tmp"), b"never archived")?;
        b.create_backup(&fx.source, &fx.store, ts("20240103_020000"))?;

        let chain = resolve_chain(&fx.store, ts("20240103_020000"))?;
        let report = apply_chain(&chain, &fx.dest, &fx.staging, &["cache".to_string()])?;

        assert_eq!(report.members_applied, 3);
        assert_eq!(tree_digest(&fx.source, &["cache"]), tree_digest(&fx.dest, &["cache"]));
        assert!(!fx.dest.join("data/old").exists());
        assert_eq!(fs::read_dir(&fx.staging)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_earlier_target_restores_earlier_state() -> Result<()> {
        let fx = fixture();
        let b = builder();

        fs::write(fx.source.join("data/app.db"), b"v1")?;
        b.create_backup(&fx.source, &fx.store, ts("20240101_020000"))?;
        let day_one = tree_digest(&fx.source, &[]);

        fs::write(fx.source.join("data/app.db"), b"v2 is longer")?;
        fs::write(fx.source.join("extra.txt"), b"x")?;
        b.create_backup(&fx.source, &fx.store, ts("20240102_020000"))?;

        let chain = resolve_chain(&fx.store, ts("20240101_120000"))?;
        apply_chain(&chain, &fx.dest, &fx.staging, &[])?;
        assert_eq!(tree_digest(&fx.dest, &[]), day_one);
        Ok(())
    }

    #[test]
    fn test_corrupt_member_leaves_destination_untouched() -> Result<()> {
        let fx = fixture();
        let b = builder();
        fs::write(fx.source.join("data/app.db"), vec![9u8; 100_000])?;
        b.create_backup(&fx.source, &fx.store, ts("20240101_020000"))?;
        fs::write(fx.source.join("data/app.db"), vec![8u8; 90_000])?;
        b.create_backup(&fx.source, &fx.store, ts("20240102_020000"))?;

        let chain = resolve_chain(&fx.store, ts("20240102_020000"))?;

        // Damage a member after resolution
        let tip = fx.store.archive_path(BackupKind::Incremental, ts("20240102_020000"));
        let bytes = fs::read(&tip)?;
        fs::write(&tip, &bytes[..bytes.len() / 2])?;

        fs::create_dir_all(&fx.dest)?;
        fs::write(fx.dest.join("live.txt"), b"keep me")?;
        let before = tree_digest(&fx.dest, &[]);

        let result = apply_chain(&chain, &fx.dest, &fx.staging, &[]);
        assert!(matches!(result, Err(VaultError::ArchiveCorrupt(_))));
        assert_eq!(tree_digest(&fx.dest, &[]), before);
        Ok(())
    }

    #[test]
    fn test_staging_dir_removed_on_drop() -> Result<()> {
        let dir = TempDir::new()?;
        let path = {
            use std::os::unix::fs::PermissionsExt;

            let staging = StagingDir::create(dir.path())?;
            let locked = staging.path().join("locked");
            fs::create_dir_all(&locked)?;
            fs::write(locked.join("f"), b"x")?;
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o555))?;
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_clean_staging_root() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("restore-leftover/sub"))?;
        fs::create_dir_all(dir.path().join("unrelated"))?;

        assert_eq!(clean_staging_root(dir.path())?, 1);
        assert!(dir.path().join("unrelated").exists());
        assert_eq!(clean_staging_root(&dir.path().join("missing"))?, 0);
        Ok(())
    }
}
