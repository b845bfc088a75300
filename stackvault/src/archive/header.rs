//! Header stored as the first member of every backup archive.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::fs::walker::EntryKind;
use crate::utils::timestamp::BackupTimestamp;

/// Archive member name holding the serialized header.
pub const HEADER_PATH: &str = ".stackvault/header.json";

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    /// File name prefix used in the snapshot store.
    pub fn prefix(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incr",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "full" => Some(BackupKind::Full),
            "incr" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// One path present in the tree when the archive was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub path: String,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub format: u32,
    pub kind: BackupKind,
    pub timestamp: BackupTimestamp,
    /// Previous member of the chain; `None` for a full backup.
    pub parent: Option<BackupTimestamp>,
    /// Marker lineage this archive was built against.
    pub marker_version: Uuid,
    pub source_root: PathBuf,
    /// Number of tree entries stored in the archive body.
    pub stored_entries: usize,
    /// Every path present at `timestamp`; extraction deletes the rest.
    pub listing: Vec<ListingEntry>,
}
