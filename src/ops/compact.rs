//! Offline compaction of a replica's record file

use crate::common::{Result, WalSyncPolicy};
use crate::replica::LocalStore;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactReport {
    pub records_dropped: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CompactReport {
    pub fn bytes_freed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Rewrite the record file keeping only live state.
pub fn compact_replica(dir: impl AsRef<Path>) -> Result<CompactReport> {
    let dir = dir.as_ref();
    tracing::info!("Compacting replica data in {:?}", dir);

    let path = LocalStore::file_path(dir);
    let bytes_before = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let mut store = LocalStore::open(dir, WalSyncPolicy::Always)?;
    let records_dropped = store.compact()?;
    drop(store);

    let bytes_after = std::fs::metadata(&path)?.len();
    Ok(CompactReport {
        records_dropped,
        bytes_before,
        bytes_after,
    })
}
