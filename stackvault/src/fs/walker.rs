//! Directory traversal with metadata preservation.
//!
//! Scans a project tree into a flat listing of files, directories and
//! symlinks. The listing drives incremental change detection and lets a
//! restored tree converge exactly, empty directories included.

use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Entry names excluded together with everything below them
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude_patterns: vec![
                // Common excludes
                ".git".to_string(),
                "node_modules".to_string(),
                ".DS_Store".to_string(),
            ],
        }
    }
}

impl WalkOptions {
    pub fn with_excludes(exclude_patterns: Vec<String>) -> Self {
        Self {
            exclude_patterns,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    pub kind: EntryKind,

    /// Size in bytes (0 for directories, link length for symlinks)
    pub size: u64,

    /// Modification time, seconds and nanoseconds since the epoch
    pub mtime: i64,
    pub mtime_nsec: i64,

    /// File depth from root
    pub depth: usize,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        // symlink_metadata when not following links, so links stay links
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        Ok(Self {
            path,
            relative_path,
            kind,
            size: if kind == EntryKind::Dir { 0 } else { metadata.len() },
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec(),
            depth: entry.depth(),
        })
    }

    /// Relative path as a `/`-separated string, the form stored in markers
    /// and archive listings.
    pub fn key(&self) -> String {
        relative_key(&self.relative_path)
    }
}

/// Normalizes a relative path to its listing key.
pub fn relative_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk a directory tree and collect every entry below `root`.
///
/// Entries come back in a stable, depth-first, name-sorted order; the root
/// itself is not included.
///
/// # Example
/// ```no_run
/// use stackvault::fs::walker::{walk_directory, WalkOptions};
/// use std::path::Path;
///
/// let entries = walk_directory(Path::new("/srv/app"), WalkOptions::default()).unwrap();
/// println!("Found {} entries", entries.len());
/// ```
pub fn walk_directory(root: &Path, options: WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    walk_directory_with_callback(root, options, |info| files.push(info.clone()))?;

    Ok(files)
}

/// Walk a directory tree with a callback for each entry
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .min_depth(1);

    let patterns = options.exclude_patterns;
    for entry in walker.into_iter().filter_entry(|e| !should_exclude(e, &patterns)) {
        let entry = entry?;
        let info = FileInfo::from_entry(&entry, root)?;
        callback(&info);
    }

    Ok(())
}

/// True when any component of `relative` is an excluded name.
pub fn is_excluded(relative: &Path, patterns: &[String]) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(part) => {
            let name = part.to_string_lossy();
            patterns.iter().any(|p| name == p.as_str())
        }
        _ => false,
    })
}

fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| file_name == p.as_str())
}
