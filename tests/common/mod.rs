//! Shared helpers for multi-replica tests

#![allow(dead_code)]

use quorumlog::{LocalCluster, Log, LogConfig, ReplicaId, WalSyncPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

pub const TIMEOUT: Duration = Duration::from_secs(2);
pub const SHORT: Duration = Duration::from_millis(200);

/// An in-process group with its data under one temp directory.
pub struct Group {
    pub dir: TempDir,
    pub cluster: LocalCluster,
    pub members: Vec<ReplicaId>,
    pub quorum: usize,
}

impl Group {
    pub fn new(replicas: u64, quorum: usize) -> Self {
        let members: Vec<ReplicaId> = (1..=replicas).collect();
        Self {
            dir: TempDir::new().unwrap(),
            cluster: LocalCluster::new(members.clone()),
            members,
            quorum,
        }
    }

    /// Fresh cluster over the same data directories, as after a full restart.
    pub fn restart(self) -> Self {
        Self {
            cluster: LocalCluster::new(self.members.clone()),
            ..self
        }
    }

    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn config(&self, id: ReplicaId, data: &str, bootstrap: bool) -> LogConfig {
        let mut config = LogConfig::new(id, self.quorum, self.members.clone(), self.data_dir(data));
        config.wal_sync = WalSyncPolicy::Always;
        config.timeout_ms = TIMEOUT.as_millis() as u64;
        config.catchup_timeout_ms = TIMEOUT.as_millis() as u64;
        config.election_backoff_ms = 10;
        config.bootstrap = bootstrap;
        config
    }

    pub async fn open(&self, id: ReplicaId) -> Log {
        let config = self.config(id, &format!("replica-{}", id), true);
        self.cluster.open_log(config).await.unwrap()
    }

    /// Open every member, in id order.
    pub async fn open_all(&self) -> Vec<Log> {
        let mut logs = Vec::new();
        for id in &self.members {
            logs.push(self.open(*id).await);
        }
        logs
    }

    /// Replicas currently holding `data` at `position`, learned or not.
    pub async fn holders(&self, position: u64, data: &[u8]) -> usize {
        let mut count = 0;
        for id in &self.members {
            if let Some(replica) = self.cluster.replica(*id) {
                if let Ok(action) = replica.get(position).await {
                    if action.kind == Some(quorumlog::common::ActionKind::Append(data.to_vec())) {
                        count += 1;
                    }
                }
            }
        }
        count
    }
}

pub fn payloads(entries: &[quorumlog::Entry]) -> Vec<Vec<u8>> {
    entries.iter().map(|e| e.data.clone()).collect()
}
