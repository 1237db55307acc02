//! Inspect a replica's durable state

use crate::common::{Result, WalSyncPolicy};
use crate::replica::{LocalStore, StoreSummary};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectReport {
    pub summary: StoreSummary,
    /// Positions up to the ending that are not learned
    pub missing: Vec<u64>,
}

/// Load a replica's store and summarize it.
///
/// Opening the store cuts off a corrupt tail, as a restart would.
pub fn inspect_replica(dir: impl AsRef<Path>) -> Result<InspectReport> {
    let store = LocalStore::open(dir, WalSyncPolicy::Never)?;
    let summary = store.summary();
    let missing = match summary.ending {
        Some(ending) => store.missing(ending),
        None => Vec::new(),
    };
    Ok(InspectReport { summary, missing })
}
