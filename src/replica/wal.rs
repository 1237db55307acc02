//! Replica record file
//!
//! Every mutation of a replica's durable state is appended here before it
//! becomes visible. Record format: [MAGIC][LEN][PAYLOAD][CRC32], where the
//! payload is a bincode-encoded [`Record`] and the checksum covers it.
//!
//! On open the file is replayed; a torn or corrupted tail (a crash in the
//! middle of a write) is cut off at the last good record. A write that fails
//! while the process keeps running is cut off the same way before the next
//! record goes in.

use crate::common::{crc32, Action, Ballot, Error, Membership, Result, WalSyncPolicy};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: [u8; 4] = [0x51, 0x4C, 0x4F, 0x47]; // "QLOG"
const HEADER_LEN: u64 = 8;
const TRAILER_LEN: u64 = 4;
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Largest append payload that fits in one record, leaving room for the
/// action's other fields.
pub const MAX_PAYLOAD_LEN: usize = MAX_RECORD_LEN as usize - 1024;

/// A single durable state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    Membership(Membership),
    Promise(Ballot),
    Action(Action),
    Beginning(u64),
}

/// Outcome of scanning a record file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: usize,
    /// Bytes up to the end of the last good record
    pub valid_bytes: u64,
    pub total_bytes: u64,
    /// Why replay stopped early, if it did
    pub error: Option<String>,
}

impl ReplayStats {
    pub fn has_corrupt_tail(&self) -> bool {
        self.valid_bytes < self.total_bytes
    }
}

pub struct Wal {
    path: PathBuf,
    file: File,
    /// End of the last complete record
    len: u64,
    sync_policy: WalSyncPolicy,
    /// A failed write could not be cut off; refuse further appends
    broken: bool,
}

impl Wal {
    /// Open or create the record file, returning every intact record.
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<(Self, Vec<Record>)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut records = Vec::new();
        let stats = Self::replay(&path, |record| {
            records.push(record);
            Ok(())
        })?;

        if stats.has_corrupt_tail() {
            tracing::warn!(
                "Truncating record file {:?} at {} of {} bytes: {}",
                path,
                stats.valid_bytes,
                stats.total_bytes,
                stats.error.as_deref().unwrap_or("unknown")
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(stats.valid_bytes)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        Ok((
            Self {
                path,
                file,
                len: stats.valid_bytes,
                sync_policy,
                broken: false,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record, honouring the sync policy.
    ///
    /// The record is either complete in the file when this returns `Ok`, or
    /// cut off again.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        if self.broken {
            return Err(Error::Corrupted(format!(
                "record file {:?} has an unrecovered partial write",
                self.path
            )));
        }

        let frame = Self::encode_frame(record)?;
        let written = self.file.write_all(&frame).and_then(|_| self.maybe_sync());
        if let Err(e) = written {
            self.rollback();
            return Err(e.into());
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    fn encode_frame(record: &Record) -> Result<Vec<u8>> {
        let payload = bincode::serialize(record)?;
        if payload.len() > MAX_RECORD_LEN as usize {
            return Err(Error::Corrupted(format!(
                "record of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_RECORD_LEN
            )));
        }

        let mut frame = Vec::with_capacity(payload.len() + (HEADER_LEN + TRAILER_LEN) as usize);
        frame.extend_from_slice(&WAL_MAGIC);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32(&payload).to_le_bytes());
        Ok(frame)
    }

    /// Sync based on policy
    fn maybe_sync(&self) -> std::io::Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => self.file.sync_data(),
            WalSyncPolicy::Interval | WalSyncPolicy::Never => Ok(()),
        }
    }

    /// Cut the file back to the last complete record.
    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.len) {
            tracing::error!(
                "Could not cut partial write off {:?} at {} bytes: {}",
                self.path,
                self.len,
                e
            );
            self.broken = true;
        }
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Scan a record file, calling `callback` for every intact record.
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<ReplayStats>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ReplayStats::default()),
            Err(e) => return Err(e.into()),
        };

        let mut stats = ReplayStats {
            total_bytes: file.metadata()?.len(),
            ..Default::default()
        };
        let mut reader = BufReader::new(file);

        loop {
            match Self::read_record(&mut reader) {
                Ok(Some((record, len))) => {
                    callback(record)?;
                    stats.records += 1;
                    stats.valid_bytes += len;
                }
                Ok(None) => break,
                Err(e) => {
                    stats.error = Some(e.to_string());
                    break;
                }
            }
        }

        Ok(stats)
    }

    /// Read one record, returning it with its encoded length.
    fn read_record<R: Read>(reader: &mut R) -> Result<Option<(Record, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != WAL_MAGIC {
            return Err(Error::Corrupted("invalid record magic".into()));
        }

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_LEN {
            return Err(Error::Corrupted(format!("record length {} out of range", len)));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let actual = crc32(&payload);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let record = bincode::deserialize(&payload)?;
        Ok(Some((record, HEADER_LEN + len as u64 + TRAILER_LEN)))
    }

    /// Replace the file's contents with `records` (after compaction).
    ///
    /// The new file is written and synced next to the old one, then renamed
    /// over it, so a crash leaves either the old or the new file.
    pub fn rewrite(&mut self, records: &[Record]) -> Result<()> {
        let temp_path = self.path.with_extension("compact");
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            for record in records {
                writer.write_all(&Self::encode_frame(record)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        self.file = OpenOptions::new()
            .append(true)
            .read(true)
            .open(&self.path)?;
        self.len = self.file.metadata()?.len();
        self.broken = false;

        Ok(())
    }
}
