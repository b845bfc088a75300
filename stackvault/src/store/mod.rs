//! Persistent backup storage: archives plus the snapshot marker.

pub mod marker;
pub mod snapshot;

pub use marker::{MarkerState, SnapshotMarker};
pub use snapshot::{BackupSet, SetEntry, SnapshotStore, StoreLayout};
