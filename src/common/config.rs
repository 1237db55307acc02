//! Configuration for a replicated log member

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier of a replica within its group.
pub type ReplicaId = u64;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log member config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from an optional TOML file, then from
    /// `QUORUMLOG_*` environment variables (e.g. `QUORUMLOG_LOG__QUORUM=2`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("QUORUMLOG")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("log.members")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        if config.log_level.is_empty() {
            config.log_level = default_log_level();
        }
        Ok(config)
    }
}

/// WAL sync policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalSyncPolicy {
    /// Fsync every record before acknowledging it
    #[default]
    Always,
    /// Hand every record to the OS, fsync on explicit sync
    Interval,
    /// Hand every record to the OS, fsync only on close (tests only)
    Never,
}

/// Replicated log member configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// This replica's id
    pub replica_id: ReplicaId,

    /// Quorum size
    pub quorum: usize,

    /// Every replica in the group, including this one
    pub members: Vec<ReplicaId>,

    /// Directory holding the replica's record file
    pub data_dir: PathBuf,

    /// Durability of store writes
    #[serde(default)]
    pub wal_sync: WalSyncPolicy,

    /// Default deadline for quorum operations
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Deadline for catch-up when the log is opened
    #[serde(default = "default_catchup_timeout")]
    pub catchup_timeout_ms: u64,

    /// Base backoff between election attempts
    #[serde(default = "default_election_backoff")]
    pub election_backoff_ms: u64,

    /// Join the group immediately with a fresh store (initial formation)
    #[serde(default)]
    pub bootstrap: bool,
}

fn default_timeout() -> u64 {
    5_000
}
fn default_catchup_timeout() -> u64 {
    10_000
}
fn default_election_backoff() -> u64 {
    50
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            replica_id: 1,
            quorum: 1,
            members: vec![1],
            data_dir: PathBuf::from("./quorumlog-data"),
            wal_sync: WalSyncPolicy::Always,
            timeout_ms: default_timeout(),
            catchup_timeout_ms: default_catchup_timeout(),
            election_backoff_ms: default_election_backoff(),
            bootstrap: false,
        }
    }
}

impl LogConfig {
    /// Configuration for replica `replica_id` of a group with the given
    /// members and quorum, storing data under `data_dir`.
    pub fn new(
        replica_id: ReplicaId,
        quorum: usize,
        members: Vec<ReplicaId>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            replica_id,
            quorum,
            members,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn catchup_timeout(&self) -> Duration {
        Duration::from_millis(self.catchup_timeout_ms)
    }

    pub fn election_backoff(&self) -> Duration {
        Duration::from_millis(self.election_backoff_ms)
    }

    /// Check the quorum arithmetic and membership.
    pub fn validate(&self) -> Result<()> {
        if self.quorum == 0 {
            return Err(Error::InvalidConfig("quorum must be at least 1".into()));
        }
        if self.members.is_empty() {
            return Err(Error::InvalidConfig("replica set is empty".into()));
        }
        let mut members = self.members.clone();
        members.sort_unstable();
        members.dedup();
        if members.len() != self.members.len() {
            return Err(Error::InvalidConfig("duplicate replica ids".into()));
        }
        if self.quorum > self.members.len() {
            return Err(Error::InvalidConfig(format!(
                "quorum {} exceeds replica count {}",
                self.quorum,
                self.members.len()
            )));
        }
        if self.quorum <= self.members.len() / 2 {
            return Err(Error::InvalidConfig(format!(
                "quorum {} does not guarantee overlap for {} replicas",
                self.quorum,
                self.members.len()
            )));
        }
        if !self.members.contains(&self.replica_id) {
            return Err(Error::InvalidConfig(format!(
                "replica {} is not a member of the group",
                self.replica_id
            )));
        }
        Ok(())
    }
}
