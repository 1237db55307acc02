//! Common utilities and types shared across quorumlog

pub mod config;
pub mod error;
pub mod protocol;
pub mod utils;

pub use config::{Config, LogConfig, ReplicaId, WalSyncPolicy};
pub use error::{Error, Result};
pub use protocol::{Action, ActionKind, Ballot, Membership};
pub use utils::{crc32, deadline_after, parse_duration, retry_with_backoff};
