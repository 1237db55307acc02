//! Log positions and entries
//!
//! A [`Position`] is the ordinal of a slot in the log's total order. Its
//! 8-byte big-endian identity is the only representation that leaves the
//! log, e.g. when an application persists "last position processed".

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of a position identity.
pub const IDENTITY_LEN: usize = 8;

/// Address of a slot in the replicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position(u64);

impl Position {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Rebuild a position from the bytes produced by [`Position::identity`].
    pub fn from_identity(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; IDENTITY_LEN] = bytes.try_into().map_err(|_| {
            Error::Format(format!(
                "expected {} bytes, got {}",
                IDENTITY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }

    /// Big-endian encoding of the position.
    pub fn identity(&self) -> [u8; IDENTITY_LEN] {
        self.0.to_be_bytes()
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The following position, or `None` past the last addressable slot.
    pub fn next(&self) -> Option<Position> {
        self.0.checked_add(1).map(Position)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Position(value)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed payload at a position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub position: Position,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(position: Position, data: Vec<u8>) -> Self {
        Self { position, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_big_endian() {
        let position = Position::new(0x0102_0304_0506_0708);
        assert_eq!(position.identity(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Position::new(0).identity(), [0; 8]);
    }

    #[test]
    fn test_identity_round_trip() {
        for value in [0, 1, 255, 256, u32::MAX as u64, u64::MAX - 1, u64::MAX] {
            let position = Position::new(value);
            assert_eq!(Position::from_identity(&position.identity()).unwrap(), position);
        }

        let bytes = [0xff, 0, 0x7f, 0x80, 1, 2, 3, 4];
        assert_eq!(Position::from_identity(&bytes).unwrap().identity(), bytes);
    }

    #[test]
    fn test_malformed_identity() {
        assert!(matches!(Position::from_identity(&[]), Err(Error::Format(_))));
        assert!(matches!(Position::from_identity(&[0; 7]), Err(Error::Format(_))));
        assert!(matches!(Position::from_identity(&[0; 9]), Err(Error::Format(_))));
    }

    #[test]
    fn test_ordering() {
        assert!(Position::new(1) < Position::new(2));
        assert!(Position::new(u64::MAX) > Position::new(0));
        assert_eq!(Position::new(7), Position::from(7));
        assert_eq!(Position::new(7).next(), Some(Position::new(8)));
        assert_eq!(Position::new(u64::MAX - 1).next(), Some(Position::new(u64::MAX)));
        assert_eq!(Position::new(u64::MAX).next(), None);
    }
}
