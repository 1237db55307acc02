//! # quorumlog
//!
//! A durable, append-only log replicated across a fixed group of replicas:
//! - Paxos-style writer election with ballots and promise persistence
//! - Quorum writes, gap-free positions, no-op filling of abandoned slots
//! - Quorum reads that repair lagging replicas
//! - Truncation and catch-up of fresh or restarted replicas
//! - CRC-framed record file per replica, recovered on restart
//!
//! ## Architecture
//!
//! ```text
//!            Writer (elected ballot)            Reader
//!                 │ promise / write / learned     │ read
//!   ┌─────────────┼───────────────┬───────────────┤
//!   │             │               │               │
//! ┌─▼──────────┐ ┌▼───────────┐ ┌─▼──────────┐
//! │ Replica 1  │ │ Replica 2  │ │ Replica 3  │   ◄── catch-up
//! │ LocalStore │ │ LocalStore │ │ LocalStore │
//! │ + records  │ │ + records  │ │ + records  │
//! └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use quorumlog::{LocalCluster, LogConfig, Position};
//! use std::time::Duration;
//!
//! # async fn demo() -> quorumlog::Result<()> {
//! let cluster = LocalCluster::new(vec![1, 2, 3]);
//! let mut logs = Vec::new();
//! for id in 1..=3 {
//!     let mut config = LogConfig::new(id, 2, vec![1, 2, 3], format!("./data/{}", id));
//!     config.bootstrap = true;
//!     logs.push(cluster.open_log(config).await?);
//! }
//!
//! let timeout = Duration::from_secs(5);
//! let writer = logs[0].writer(timeout, 3).await?;
//! let first = writer.append(b"x".to_vec(), timeout).await?;
//! writer.append(b"y".to_vec(), timeout).await?;
//!
//! let entries = logs[1].reader().read(first, Position::new(1), timeout).await?;
//! assert_eq!(entries.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ### Maintenance
//! ```bash
//! quorumlog inspect --data ./data/1
//! quorumlog verify --data ./data/1
//! quorumlog compact --data ./data/1
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod log;
pub mod network;
pub mod ops;
pub mod position;
mod reader;
pub mod replica;

// Re-export commonly used types
pub use common::{Config, Error, LogConfig, ReplicaId, Result, WalSyncPolicy};
pub use log::{Log, Reader, Writer};
pub use network::{LocalCluster, Network};
pub use position::{Entry, Position};
pub use replica::wal::MAX_PAYLOAD_LEN;
pub use replica::{Replica, ReplicaStatus};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
