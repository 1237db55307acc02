//! Replica protocol messages
//!
//! Transport agnostic: every message is serde-serializable and
//! [`encode`]/[`decode`] give the bincode wire form.

use crate::common::{ReplicaId, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Election epoch. Ordered by round, ties broken by replica id.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    pub round: u64,
    pub replica: ReplicaId,
}

impl Ballot {
    /// The promise every replica starts with.
    pub const ZERO: Ballot = Ballot {
        round: 0,
        replica: 0,
    };

    pub fn new(round: u64, replica: ReplicaId) -> Self {
        Self { round, replica }
    }

    /// Smallest ballot owned by `replica` that beats `self`.
    pub fn successor(&self, replica: ReplicaId) -> Ballot {
        Ballot {
            round: self.round + 1,
            replica,
        }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.round, self.replica)
    }
}

/// What a position holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Filler for a position nobody could confirm
    Nop,
    /// Client payload
    Append(Vec<u8>),
    /// Everything strictly below `to` is deleted
    Truncate { to: u64 },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Nop => "nop",
            ActionKind::Append(_) => "append",
            ActionKind::Truncate { .. } => "truncate",
        }
    }
}

/// Per-position record kept by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub position: u64,
    /// Ballot of the proposal this replica accepted
    pub performed: Option<Ballot>,
    /// Set once the action is known to be committed
    pub learned: bool,
    pub kind: Option<ActionKind>,
}

impl Action {
    /// An accepted, not yet learned, proposal.
    pub fn proposal(position: u64, ballot: Ballot, kind: ActionKind) -> Self {
        Self {
            position,
            performed: Some(ballot),
            learned: false,
            kind: Some(kind),
        }
    }

    /// The same action, marked committed.
    pub fn learned(mut self) -> Self {
        self.learned = true;
        self
    }

    /// Truncation boundary carried by a committed truncate action.
    pub fn truncates_to(&self) -> Option<u64> {
        match (&self.kind, self.learned) {
            (Some(ActionKind::Truncate { to }), true) => Some(*to),
            _ => None,
        }
    }
}

/// Persisted participation state of a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// Fresh store that never joined the group
    #[default]
    Empty,
    /// Catch-up started but did not finish
    Recovering,
    /// Participates in elections and quorums
    Voting,
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Membership::Empty => write!(f, "empty"),
            Membership::Recovering => write!(f, "recovering"),
            Membership::Voting => write!(f, "voting"),
        }
    }
}

/// Election promise (`position == None`) or per-position recovery promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRequest {
    pub ballot: Ballot,
    pub position: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromiseResponse {
    Granted {
        ballot: Ballot,
        /// Highest position this replica has stored
        ending: Option<u64>,
        /// Stored action for the requested position, if any
        action: Option<Action>,
    },
    Rejected {
        promised: Ballot,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub ballot: Ballot,
    pub position: u64,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteResponse {
    Accepted { ballot: Ballot, position: u64 },
    Rejected { promised: Ballot },
}

/// Quorum read of `[from, to]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub beginning: u64,
    pub ending: Option<u64>,
    pub actions: Vec<Action>,
}

/// Ask a peer for everything it holds from `from` onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupRequest {
    pub from: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupResponse {
    pub membership: Membership,
    pub promised: Ballot,
    pub beginning: u64,
    pub ending: Option<u64>,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Promise(PromiseRequest),
    Write(WriteRequest),
    Learned(Action),
    Read(ReadRequest),
    Catchup(CatchupRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Promise(PromiseResponse),
    Write(WriteResponse),
    Read(ReadResponse),
    Catchup(CatchupResponse),
    Ack,
}

/// Coarse message classification, used by transports for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Elect,
    Recover,
    Write,
    Learned,
    Read,
    Catchup,
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::Promise(PromiseRequest { position: None, .. }) => MessageKind::Elect,
            Request::Promise(PromiseRequest { position: Some(_), .. }) => MessageKind::Recover,
            Request::Write(_) => MessageKind::Write,
            Request::Learned(_) => MessageKind::Learned,
            Request::Read(_) => MessageKind::Read,
            Request::Catchup(_) => MessageKind::Catchup,
        }
    }
}

/// Encode a message for the wire.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Decode a message received from the wire.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
