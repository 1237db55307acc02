//! Ops commands for replica data directories
//!
//! These work on a replica's record file directly and must not run while
//! the replica is open.

pub mod compact;
pub mod inspect;
pub mod verify;

pub use compact::{compact_replica, CompactReport};
pub use inspect::{inspect_replica, InspectReport};
pub use verify::{verify_replica, VerifyReport};
