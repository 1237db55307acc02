//! Durable per-replica state
//!
//! A [`LocalStore`] keeps the replica's promise, membership, truncation
//! point and per-position actions in memory, backed by the record file.
//! Every mutation reaches the record file before the in-memory view.

use super::wal::{Record, ReplayStats, Wal};
use crate::common::{Action, Ballot, Error, Membership, Result, WalSyncPolicy};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the record file inside a replica's data directory.
pub const STORE_FILE: &str = "replica.log";

/// Summary used by the maintenance tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub membership: Membership,
    pub promised: Ballot,
    pub beginning: u64,
    pub ending: Option<u64>,
    pub actions: usize,
    pub learned: usize,
    pub records: usize,
}

pub struct LocalStore {
    wal: Wal,
    promised: Ballot,
    membership: Membership,
    beginning: u64,
    actions: BTreeMap<u64, Action>,
    /// Records in the file, including superseded ones
    records: usize,
}

impl LocalStore {
    /// Open the store in `dir`, replaying the record file.
    pub fn open(dir: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = Self::file_path(dir);
        let (wal, records) = Wal::open(&path, sync_policy)?;

        let mut store = Self {
            wal,
            promised: Ballot::ZERO,
            membership: Membership::Empty,
            beginning: 0,
            actions: BTreeMap::new(),
            records: records.len(),
        };
        for record in records {
            store.apply(record);
        }

        tracing::debug!(
            "Opened store {:?}: {} actions, beginning {}, promised {}, {}",
            path,
            store.actions.len(),
            store.beginning,
            store.promised,
            store.membership
        );
        Ok(store)
    }

    pub fn file_path(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(STORE_FILE)
    }

    /// Scan a store's record file without opening it for writing.
    pub fn scan(dir: impl AsRef<Path>) -> Result<ReplayStats> {
        Wal::replay(Self::file_path(dir), |_| Ok(()))
    }

    fn persist(&mut self, record: Record) -> Result<()> {
        self.wal.append(&record)?;
        self.records += 1;
        self.apply(record);
        Ok(())
    }

    fn apply(&mut self, record: Record) {
        match record {
            Record::Membership(membership) => self.membership = membership,
            Record::Promise(ballot) => self.promised = self.promised.max(ballot),
            Record::Beginning(to) => self.advance_beginning(to),
            Record::Action(action) => {
                if action.position < self.beginning {
                    return;
                }
                let truncate = action.truncates_to();
                self.actions.insert(action.position, action);
                if let Some(to) = truncate {
                    self.advance_beginning(to);
                }
            }
        }
    }

    fn advance_beginning(&mut self, to: u64) {
        if to <= self.beginning {
            return;
        }
        self.beginning = to;
        self.actions = self.actions.split_off(&to);
    }

    pub fn promised(&self) -> Ballot {
        self.promised
    }

    /// Persist a promise not to accept anything below `ballot`.
    pub fn promise(&mut self, ballot: Ballot) -> Result<()> {
        if ballot <= self.promised {
            return Ok(());
        }
        self.persist(Record::Promise(ballot))
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn set_membership(&mut self, membership: Membership) -> Result<()> {
        if membership == self.membership {
            return Ok(());
        }
        self.persist(Record::Membership(membership))
    }

    /// Lowest position that has not been truncated.
    pub fn beginning(&self) -> u64 {
        self.beginning
    }

    /// Move the truncation point forward, discarding older actions.
    pub fn truncate(&mut self, to: u64) -> Result<()> {
        if to <= self.beginning {
            return Ok(());
        }
        self.persist(Record::Beginning(to))
    }

    /// Highest position holding an action.
    pub fn ending(&self) -> Option<u64> {
        self.actions.keys().next_back().copied()
    }

    /// Store `action`. Actions below the beginning are dropped.
    ///
    /// Returns whether the action was stored.
    pub fn put(&mut self, action: Action) -> Result<bool> {
        if action.position < self.beginning {
            return Ok(false);
        }
        self.persist(Record::Action(action))?;
        Ok(true)
    }

    pub fn get(&self, position: u64) -> Result<Action> {
        self.actions
            .get(&position)
            .cloned()
            .ok_or(Error::NotFound(position))
    }

    pub fn lookup(&self, position: u64) -> Option<&Action> {
        self.actions.get(&position)
    }

    /// Stored actions within `[from, to]`.
    pub fn range(&self, from: u64, to: u64) -> Vec<Action> {
        if from > to {
            return Vec::new();
        }
        self.actions.range(from..=to).map(|(_, a)| a.clone()).collect()
    }

    /// Positions in `[beginning, to]` not known to be committed locally.
    pub fn missing(&self, to: u64) -> Vec<u64> {
        (self.beginning..=to)
            .filter(|p| !self.actions.get(p).is_some_and(|a| a.learned))
            .collect()
    }

    pub fn summary(&self) -> StoreSummary {
        StoreSummary {
            membership: self.membership,
            promised: self.promised,
            beginning: self.beginning,
            ending: self.ending(),
            actions: self.actions.len(),
            learned: self.actions.values().filter(|a| a.learned).count(),
            records: self.records,
        }
    }

    /// Rewrite the record file with only live state.
    ///
    /// Returns the number of records dropped.
    pub fn compact(&mut self) -> Result<usize> {
        let mut live = Vec::with_capacity(self.actions.len() + 3);
        live.push(Record::Membership(self.membership));
        if self.promised != Ballot::ZERO {
            live.push(Record::Promise(self.promised));
        }
        if self.beginning > 0 {
            live.push(Record::Beginning(self.beginning));
        }
        live.extend(self.actions.values().cloned().map(Record::Action));

        self.wal.rewrite(&live)?;

        let dropped = self.records.saturating_sub(live.len());
        tracing::info!(
            "Compacted {:?}: {} records kept, {} dropped",
            self.wal.path(),
            live.len(),
            dropped
        );
        self.records = live.len();
        Ok(dropped)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.wal.sync()
    }
}
