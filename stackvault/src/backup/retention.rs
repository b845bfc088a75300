//! Chain-aware retention.
//!
//! Sets are grouped into chains (a full backup and the incrementals up to
//! the next full). The most recent chain is never touched. Inside an older
//! chain, members are removed newest first, and only while nothing newer in
//! the same chain is being kept; the full goes last.

use tracing::info;

use crate::archive::BackupKind;
use crate::store::{SetEntry, SnapshotStore};
use crate::utils::errors::Result;
use crate::utils::timestamp::BackupTimestamp;

#[derive(Debug, Default, Clone)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub kept: usize,
}

/// Split chronologically ordered sets into chains. Incrementals that precede
/// every full form a rootless leading chain.
fn group_chains(sets: Vec<SetEntry>) -> Vec<Vec<SetEntry>> {
    let mut chains: Vec<Vec<SetEntry>> = Vec::new();
    for set in sets {
        match chains.last_mut() {
            Some(chain) if set.kind == BackupKind::Incremental => chain.push(set),
            _ => chains.push(vec![set]),
        }
    }
    chains
}

/// Members of `chain` to delete, newest first.
fn expired_members(chain: &[SetEntry], cutoff: BackupTimestamp) -> Vec<&SetEntry> {
    let mut expired = Vec::new();
    for member in chain.iter().rev() {
        if member.timestamp >= cutoff {
            break;
        }
        expired.push(member);
    }
    expired
}

/// Delete sets older than `retention` relative to `now`.
pub fn prune(store: &SnapshotStore, now: BackupTimestamp, retention: chrono::Duration) -> Result<PruneReport> {
    let cutoff = now.minus(retention);
    let sets = store.list()?;
    let total = sets.len();
    let mut chains = group_chains(sets);

    // The chain of the most recent full is always kept
    let current = chains
        .iter()
        .rposition(|c| c.first().map(|s| s.kind == BackupKind::Full).unwrap_or(false));
    if let Some(index) = current {
        chains.truncate(index);
    } else {
        chains.clear();
    }

    let mut report = PruneReport::default();
    for chain in &chains {
        for member in expired_members(chain, cutoff) {
            store.delete(member)?;
            report.deleted.push(member.file_name.clone());
        }
    }
    report.kept = total - report.deleted.len();

    if !report.deleted.is_empty() {
        info!(
            store = %store.root().display(),
            "Retention removed {} set(s), kept {}",
            report.deleted.len(),
            report.kept
        );
    }
    Ok(report)
}
