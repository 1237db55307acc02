//! Verify a replica's record file

use crate::common::Result;
use crate::replica::LocalStore;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub records: usize,
    pub valid_bytes: u64,
    pub total_bytes: u64,
    /// First problem found, if any
    pub error: Option<String>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none() && self.valid_bytes == self.total_bytes
    }

    /// Bytes that would be cut off when the replica next opens.
    pub fn corrupt_bytes(&self) -> u64 {
        self.total_bytes - self.valid_bytes
    }
}

/// Scan every record and check its framing and checksum. Read-only.
pub fn verify_replica(dir: impl AsRef<Path>) -> Result<VerifyReport> {
    let dir = dir.as_ref();
    tracing::info!("Verifying replica data in {:?}", dir);

    let stats = LocalStore::scan(dir)?;
    let report = VerifyReport {
        records: stats.records,
        valid_bytes: stats.valid_bytes,
        total_bytes: stats.total_bytes,
        error: stats.error,
    };

    if !report.is_healthy() {
        tracing::warn!(
            "{} corrupt bytes after record {}: {}",
            report.corrupt_bytes(),
            report.records,
            report.error.as_deref().unwrap_or("truncated record")
        );
    }
    Ok(report)
}
