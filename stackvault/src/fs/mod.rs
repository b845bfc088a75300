//! Filesystem helpers: tree scanning and mirroring.

pub mod mirror;
pub mod walker;

use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const OWNER_RWX: u32 = 0o700;

/// Give the owner full access to every directory below `root` so children
/// can be written and removed. Returns the modes that were changed, parents
/// before children.
pub(crate) fn loosen_dirs(root: &Path) -> io::Result<Vec<(PathBuf, Permissions)>> {
    let mut changed = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let perms = entry.metadata()?.permissions();
        if perms.mode() & OWNER_RWX != OWNER_RWX {
            fs::set_permissions(entry.path(), Permissions::from_mode(perms.mode() | OWNER_RWX))?;
            changed.push((entry.path().to_path_buf(), perms));
        }
    }
    Ok(changed)
}

/// Apply directory modes children first, skipping paths that no longer exist.
pub(crate) fn apply_dir_modes(modes: &[(PathBuf, Permissions)]) -> io::Result<()> {
    for (path, perms) in modes.iter().rev() {
        match fs::set_permissions(path, perms.clone()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
