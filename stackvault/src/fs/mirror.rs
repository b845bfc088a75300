//! Directory mirroring with delete-on-mismatch semantics.
//!
//! After `mirror(src, dst)` the destination holds exactly the source tree:
//! changed files are replaced, missing entries created and entries absent
//! from the source removed. Excluded names are never touched in the
//! destination.

use std::collections::HashSet;
use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::{apply_dir_modes, loosen_dirs};
use super::walker::{is_excluded, relative_key, walk_directory, EntryKind, FileInfo, WalkOptions};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorStats {
    pub copied: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// Mirror `src` onto `dst`, leaving destination entries matching `excludes` alone.
pub fn mirror(src: &Path, dst: &Path, excludes: &[String]) -> io::Result<MirrorStats> {
    let mut stats = MirrorStats::default();
    fs::create_dir_all(dst)?;
    let loosened = loosen_dirs(dst)?;

    let entries = walk_directory(src, WalkOptions::with_excludes(Vec::new()))?;
    let mut wanted = HashSet::with_capacity(entries.len());
    // Directory modes land once their children are in place
    let mut dir_modes: Vec<(PathBuf, Permissions)> = Vec::new();

    for entry in &entries {
        wanted.insert(entry.key());
        let target = dst.join(&entry.relative_path);
        match entry.kind {
            EntryKind::Dir => {
                clear_if(&target, |m| !m.is_dir() || m.file_type().is_symlink())?;
                fs::create_dir_all(&target)?;
                dir_modes.push((target, fs::symlink_metadata(&entry.path)?.permissions()));
            }
            EntryKind::File => {
                if copy_if_changed(entry, &target)? {
                    stats.copied += 1;
                } else {
                    stats.unchanged += 1;
                }
            }
            EntryKind::Symlink => {
                let link_target = fs::read_link(&entry.path)?;
                let same = fs::read_link(&target).map(|t| t == link_target).unwrap_or(false);
                if same {
                    stats.unchanged += 1;
                } else {
                    clear_if(&target, |_| true)?;
                    std::os::unix::fs::symlink(&link_target, &target)?;
                    stats.copied += 1;
                }
            }
        }
    }

    // Children are listed before their parents, so directories empty out first.
    let mut stale = Vec::new();
    let walker = WalkDir::new(dst).min_depth(1).contents_first(true);
    for entry in walker.into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(dst).unwrap_or(e.path());
        !is_excluded(rel, excludes)
    }) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(dst).unwrap_or(entry.path());
        if !wanted.contains(&relative_key(rel)) {
            stale.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
        }
    }

    for (path, is_dir) in stale {
        let result = if is_dir { fs::remove_dir(&path) } else { fs::remove_file(&path) };
        match result {
            Ok(()) => stats.removed += 1,
            // A stale directory that still holds excluded entries stays.
            Err(e) if is_dir => debug!("Keeping {}: {}", path.display(), e),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    let restated: HashSet<&Path> = dir_modes.iter().map(|(p, _)| p.as_path()).collect();
    let untouched: Vec<(PathBuf, Permissions)> = loosened
        .iter()
        .filter(|(p, _)| !restated.contains(p.as_path()))
        .cloned()
        .collect();
    apply_dir_modes(&untouched)?;
    apply_dir_modes(&dir_modes)?;

    Ok(stats)
}

/// Removes whatever sits at `path` when `predicate` holds for its metadata.
fn clear_if<F>(path: &Path, predicate: F) -> io::Result<()>
where
    F: Fn(&fs::Metadata) -> bool,
{
    match fs::symlink_metadata(path) {
        Ok(meta) if predicate(&meta) => {
            if meta.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            }
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copies through a temporary sibling and renames into place. Size and mtime
/// equality is treated as unchanged, the same heuristic rsync uses.
fn copy_if_changed(entry: &FileInfo, target: &Path) -> io::Result<bool> {
    let src_meta = fs::symlink_metadata(&entry.path)?;
    if let Ok(dst_meta) = fs::symlink_metadata(target) {
        if dst_meta.is_file()
            && dst_meta.len() == src_meta.len()
            && dst_meta.modified().ok() == src_meta.modified().ok()
        {
            return Ok(false);
        }
    }

    clear_if(target, |m| !m.is_file())?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = target.with_file_name(format!(".{}.stackvault-tmp", file_name));
    fs::copy(&entry.path, &tmp)?;
    // The copy carries the source mode, which may forbid the mtime write
    fs::set_permissions(&tmp, Permissions::from_mode(src_meta.permissions().mode() | 0o200))?;
    File::options()
        .write(true)
        .open(&tmp)?
        .set_modified(src_meta.modified()?)?;
    fs::set_permissions(&tmp, src_meta.permissions())?;
    fs::rename(&tmp, target)?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mirror_into_empty_destination() -> io::Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::create_dir_all(src.path().join("conf/empty"))?;
        fs::write(src.path().join("conf/app.env"), b"PORT=80")?;
        std::os::unix::fs::symlink("conf/app.env", src.path().join(".env"))?;

        let stats = mirror(src.path(), dst.path(), &[])?;

        assert_eq!(stats.copied, 2);
        assert_eq!(fs::read(dst.path().join("conf/app.env"))?, b"PORT=80");
        assert!(dst.path().join("conf/empty").is_dir());
        assert_eq!(fs::read_link(dst.path().join(".env"))?, Path::new("conf/app.env"));
        Ok(())
    }

    #[test]
    fn test_mirror_removes_stale_entries() -> io::Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::write(src.path().join("keep.txt"), b"new")?;
        fs::write(dst.path().join("keep.txt"), b"old contents")?;
        fs::create_dir_all(dst.path().join("stale/nested"))?;
        fs::write(dst.path().join("stale/nested/file"), b"x")?;
        fs::write(dst.path().join("gone.txt"), b"x")?;

        let stats = mirror(src.path(), dst.path(), &[])?;

        assert_eq!(fs::read(dst.path().join("keep.txt"))?, b"new");
        assert!(!dst.path().join("stale").exists());
        assert!(!dst.path().join("gone.txt").exists());
        assert_eq!(stats.removed, 4);
        Ok(())
    }

    #[test]
    fn test_mirror_leaves_excluded_entries() -> io::Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::write(src.path().join("a.txt"), b"a")?;
        fs::create_dir_all(dst.path().join(".git"))?;
        fs::write(dst.path().join(".git/HEAD"), b"ref")?;

        mirror(src.path(), dst.path(), &[".git".to_string()])?;

        assert!(dst.path().join(".git/HEAD").exists());
        Ok(())
    }

    #[test]
    fn test_second_mirror_is_a_noop() -> io::Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::write(src.path().join("a.txt"), b"a")?;

        mirror(src.path(), dst.path(), &[])?;
        let stats = mirror(src.path(), dst.path(), &[])?;

        assert_eq!(stats.copied, 0);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.removed, 0);
        Ok(())
    }

    #[test]
    fn test_read_only_directories_are_mirrored_twice() -> io::Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        let locked = src.path().join("locked");
        fs::create_dir_all(&locked)?;
        fs::write(locked.join("a.txt"), b"a")?;
        fs::write(locked.join("ro.txt"), b"ro")?;
        fs::set_permissions(locked.join("ro.txt"), Permissions::from_mode(0o444))?;
        fs::set_permissions(&locked, Permissions::from_mode(0o555))?;

        mirror(src.path(), dst.path(), &[])?;
        fs::set_permissions(&locked, Permissions::from_mode(0o755))?;
        fs::write(locked.join("a.txt"), b"changed")?;
        fs::set_permissions(&locked, Permissions::from_mode(0o555))?;
        mirror(src.path(), dst.path(), &[])?;

        let out = dst.path().join("locked");
        assert_eq!(fs::read(out.join("a.txt"))?, b"changed");
        assert_eq!(fs::read(out.join("ro.txt"))?, b"ro");
        assert_eq!(fs::metadata(&out)?.permissions().mode() & 0o777, 0o555);
        assert_eq!(fs::metadata(out.join("ro.txt"))?.permissions().mode() & 0o777, 0o444);

        fs::set_permissions(&locked, Permissions::from_mode(0o755))?;
        fs::set_permissions(&out, Permissions::from_mode(0o755))?;
        Ok(())
    }

    #[test]
    fn test_directory_replaces_file() -> io::Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        fs::create_dir_all(src.path().join("data"))?;
        fs::write(src.path().join("data/x"), b"x")?;
        fs::write(dst.path().join("data"), b"was a file")?;

        mirror(src.path(), dst.path(), &[])?;

        assert!(dst.path().join("data").is_dir());
        assert_eq!(fs::read(dst.path().join("data/x"))?, b"x");
        Ok(())
    }
}
