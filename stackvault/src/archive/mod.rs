//! Archive codec: tar stream with a listing header, compressed with
//! multi-threaded zstd.
//!
//! An archive holds a header member followed by the tree entries that changed
//! since the marker it was built against (all of them for a full backup).
//! The header's listing records every path present at backup time so that
//! replaying a chain also replays deletions.

pub mod header;

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::fs::walker::{relative_key, FileInfo};
use crate::fs::{apply_dir_modes, loosen_dirs};
use crate::utils::errors::{Result, VaultError};
pub use header::{ArchiveHeader, BackupKind, ListingEntry, HEADER_PATH};

/// File extension of compressed archives.
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

/// Compression settings for archive creation
#[derive(Debug, Clone, Copy)]
pub struct CompressionOptions {
    pub level: i32,
    pub workers: u32,
}

impl CompressionOptions {
    /// Sizes the worker pool to a fraction of the available CPUs.
    pub fn from_cpu_fraction(level: i32, fraction: f64) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            level,
            workers: compression_workers(cpus, fraction),
        }
    }
}

fn compression_workers(cpus: usize, fraction: f64) -> u32 {
    let fraction = fraction.clamp(0.0, 1.0);
    ((cpus as f64 * fraction).ceil() as u32).max(1)
}

/// Write a new archive at `dest`.
///
/// `entries` are the tree entries stored in the body, relative to
/// `source_root`. Returns the compressed size in bytes.
pub fn write_archive(
    dest: &Path,
    source_root: &Path,
    header: &ArchiveHeader,
    entries: &[FileInfo],
    options: CompressionOptions,
) -> Result<u64> {
    let file = File::create(dest)?;
    let mut encoder = zstd::stream::write::Encoder::new(BufWriter::new(file), options.level)?;
    if options.workers > 1 {
        encoder.multithread(options.workers)?;
    }

    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let header_bytes = serde_json::to_vec(header)?;
    let mut tar_header = Header::new_gnu();
    tar_header.set_entry_type(EntryType::Regular);
    tar_header.set_size(header_bytes.len() as u64);
    tar_header.set_mode(0o644);
    tar_header.set_mtime(header.timestamp.as_datetime().and_utc().timestamp().max(0) as u64);
    tar_header.set_cksum();
    builder.append_data(&mut tar_header, HEADER_PATH, header_bytes.as_slice())?;

    for entry in entries {
        let src = source_root.join(&entry.relative_path);
        builder.append_path_with_name(&src, &entry.relative_path)?;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(fs::metadata(dest)?.len())
}

/// Read only the header member of an archive.
pub fn read_header(path: &Path) -> Result<ArchiveHeader> {
    let mut archive = open_archive(path)?;
    let mut entries = archive.entries()?;
    let mut first = entries
        .next()
        .ok_or_else(|| corrupt(path, "archive is empty"))??;
    parse_header(path, &mut first)
}

/// Decompression self-test: decodes every member and checks the header.
///
/// Returns the header when the archive is sound.
pub fn verify_archive(path: &Path) -> Result<ArchiveHeader> {
    let mut archive = open_archive(path)?;
    let mut entries = archive.entries().map_err(|e| corrupt(path, e))?;

    let mut first = entries
        .next()
        .ok_or_else(|| corrupt(path, "archive is empty"))?
        .map_err(|e| corrupt(path, e))?;
    let header = parse_header(path, &mut first)?;

    let mut stored = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(path, e))?;
        io::copy(&mut entry, &mut io::sink()).map_err(|e| corrupt(path, e))?;
        stored += 1;
    }

    if stored != header.stored_entries {
        return Err(corrupt(
            path,
            format!("expected {} entries, found {}", header.stored_entries, stored),
        ));
    }

    Ok(header)
}

/// Boolean form of [`verify_archive`].
pub fn test_archive(path: &Path) -> bool {
    match verify_archive(path) {
        Ok(_) => true,
        Err(e) => {
            warn!("Integrity check failed for {}: {}", path.display(), e);
            false
        }
    }
}

/// Extract an archive on top of `dir`, then delete every entry below `dir`
/// that is absent from the archive's listing.
pub fn extract_archive(path: &Path, dir: &Path) -> Result<ArchiveHeader> {
    let mut archive = open_archive(path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut entries = archive.entries()?;
    let mut first = entries
        .next()
        .ok_or_else(|| corrupt(path, "archive is empty"))??;
    let header = parse_header(path, &mut first)?;

    fs::create_dir_all(dir)?;
    let loosened = loosen_dirs(dir)?;
    // Directories are unpacked last so their modes cannot block their children
    let mut directories = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(path, e))?;
        let entry_path = entry.path()?.into_owned();
        let replacing_dir = entry.header().entry_type() == EntryType::Directory;
        // Replace links and type changes instead of writing through them
        let target = dir.join(&entry_path);
        if let Ok(meta) = fs::symlink_metadata(&target) {
            if meta.file_type().is_symlink() || (meta.is_dir() && !replacing_dir) {
                remove_any(&target)?;
            } else if !meta.is_dir() && replacing_dir {
                fs::remove_file(&target)?;
            }
        }
        if replacing_dir {
            directories.push(entry);
            continue;
        }
        if !entry.unpack_in(dir).map_err(|e| corrupt(path, e))? {
            warn!("Skipped unsafe archive path {}", entry_path.display());
        }
    }

    let removed = prune_to_listing(dir, &header.listing)?;

    let mut restated = HashSet::new();
    directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
    for mut entry in directories {
        let entry_path = entry.path()?.into_owned();
        if entry.unpack_in(dir).map_err(|e| corrupt(path, e))? {
            restated.insert(dir.join(&entry_path));
        } else {
            warn!("Skipped unsafe archive path {}", entry_path.display());
        }
    }
    let untouched: Vec<_> = loosened
        .into_iter()
        .filter(|(p, _)| !restated.contains(p))
        .collect();
    apply_dir_modes(&untouched)?;

    debug!(
        "Extracted {} ({} stored, {} removed)",
        path.display(),
        header.stored_entries,
        removed
    );

    Ok(header)
}

fn prune_to_listing(dir: &Path, listing: &[ListingEntry]) -> Result<usize> {
    let keep: HashSet<&str> = listing.iter().map(|e| e.path.as_str()).collect();
    let mut stale = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if !keep.contains(relative_key(rel).as_str()) {
            stale.push(entry.path().to_path_buf());
        }
    }

    for path in &stale {
        remove_any(path)?;
    }
    Ok(stale.len())
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn open_archive(path: &Path) -> Result<Archive<zstd::stream::read::Decoder<'static, BufReader<File>>>> {
    let file = File::open(path)?;
    let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| corrupt(path, e))?;
    Ok(Archive::new(decoder))
}

fn parse_header<R: Read>(path: &Path, entry: &mut tar::Entry<'_, R>) -> Result<ArchiveHeader> {
    let name = entry.path().map_err(|e| corrupt(path, e))?;
    if name.as_ref() != Path::new(HEADER_PATH) {
        return Err(corrupt(path, "missing archive header"));
    }
    let mut raw = Vec::new();
    entry.read_to_end(&mut raw).map_err(|e| corrupt(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| corrupt(path, e))
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> VaultError {
    VaultError::ArchiveCorrupt(format!("{}: {}", path.display(), reason))
}
