//! Coordinator: the writer side of the replicated log
//!
//! The coordinator is responsible for:
//! - Winning an election for a ballot (see [`election`])
//! - Filling positions left unconfirmed by earlier writers
//! - Assigning positions to appends and truncations, gap-free
//! - Two-phase replication: quorum write, then commit
//! - Stepping down when a higher ballot shows up

pub mod election;

use crate::common::protocol::{Request, Response, WriteRequest, WriteResponse};
use crate::common::{Action, ActionKind, Ballot, Error, ReplicaId, Result};
use crate::network::{Broadcast, Network};
use crate::replica::wal::MAX_PAYLOAD_LEN;
use crate::replica::Replica;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A proposal whose write phase did not finish.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Proposal {
    position: u64,
    kind: ActionKind,
}

pub struct Coordinator {
    replica: Arc<Replica>,
    network: Arc<dyn Network>,
    quorum: usize,
    election_backoff: Duration,
    /// Ballot won in the last election, cleared on demotion
    ballot: Option<Ballot>,
    /// Next position to assign
    index: u64,
    pending: Option<Proposal>,
}

impl Coordinator {
    pub fn new(
        replica: Arc<Replica>,
        network: Arc<dyn Network>,
        quorum: usize,
        election_backoff: Duration,
    ) -> Self {
        Self {
            replica,
            network,
            quorum,
            election_backoff,
            ballot: None,
            index: 0,
            pending: None,
        }
    }

    pub fn ballot(&self) -> Option<Ballot> {
        self.ballot
    }

    /// Next position an append would be assigned.
    pub fn index(&self) -> u64 {
        self.index
    }

    fn elected_ballot(&self) -> Result<Ballot> {
        self.ballot
            .ok_or_else(|| Error::WriterFailed("coordinator is not elected".into()))
    }

    /// Append `data` at the next position.
    pub async fn append(&mut self, data: Vec<u8>, deadline: Instant) -> Result<u64> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(Error::OperationFailed(format!(
                "payload of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        self.redrive(deadline).await?;
        let position = self.index;
        self.propose(position, ActionKind::Append(data), deadline)
            .await?;
        Ok(position)
    }

    /// Delete every position below `to`. Returns the effective beginning.
    pub async fn truncate(&mut self, to: u64, deadline: Instant) -> Result<u64> {
        self.redrive(deadline).await?;
        if to > self.index {
            return Err(Error::OperationFailed(format!(
                "cannot truncate to {}: log ends before position {}",
                to, self.index
            )));
        }
        let position = self.index;
        self.propose(position, ActionKind::Truncate { to }, deadline)
            .await?;
        Ok(self.replica.beginning().await)
    }

    /// Finish a proposal left over from a timed-out call before assigning
    /// new positions.
    async fn redrive(&mut self, deadline: Instant) -> Result<()> {
        self.elected_ballot()?;
        if let Some(proposal) = self.pending.clone() {
            tracing::debug!(
                "Re-driving {} proposal at position {}",
                proposal.kind.name(),
                proposal.position
            );
            self.propose(proposal.position, proposal.kind, deadline)
                .await?;
        }
        Ok(())
    }

    async fn propose(&mut self, position: u64, kind: ActionKind, deadline: Instant) -> Result<()> {
        let ballot = self.elected_ballot()?;
        self.pending = Some(Proposal {
            position,
            kind: kind.clone(),
        });

        self.write(ballot, position, kind.clone(), deadline).await?;
        self.commit(Action::proposal(position, ballot, kind), deadline)
            .await?;

        self.pending = None;
        self.index = position + 1;
        Ok(())
    }

    /// Write phase: a quorum must accept `kind` at `position`.
    async fn write(
        &mut self,
        ballot: Ballot,
        position: u64,
        kind: ActionKind,
        deadline: Instant,
    ) -> Result<()> {
        let request = Request::Write(WriteRequest {
            ballot,
            position,
            kind,
        });
        let mut broadcast = Broadcast::to_all(&self.network, &request, deadline);

        let mut accepted = 0;
        while accepted < self.quorum {
            match broadcast.next().await {
                Some((_, Response::Write(WriteResponse::Accepted { ballot: b, position: p })))
                    if b == ballot && p == position =>
                {
                    accepted += 1;
                }
                Some((from, Response::Write(WriteResponse::Rejected { promised }))) => {
                    tracing::info!(
                        "Write at position {} rejected by replica {}: promised {}",
                        position,
                        from,
                        promised
                    );
                    self.demote().await;
                    return Err(Error::WriterFailed(format!(
                        "ballot {} superseded by {}",
                        ballot, promised
                    )));
                }
                Some((from, other)) => {
                    tracing::warn!("Unexpected write reply from {}: {:?}", from, other);
                }
                None => {
                    return Err(Error::Timeout(format!(
                        "write at position {} accepted by {} of {} replicas",
                        position, accepted, self.quorum
                    )));
                }
            }
        }
        Ok(())
    }

    /// Commit phase: learn locally, then tell every other member.
    ///
    /// A truncation only moves a replica's beginning once it is learned
    /// there, so it is not done until a quorum acknowledged it. Other
    /// actions are settled by the write quorum and only need the local copy.
    async fn commit(&self, action: Action, deadline: Instant) -> Result<()> {
        let action = action.learned();
        self.replica.learn(action.clone()).await?;

        let required = match action.kind {
            Some(ActionKind::Truncate { .. }) => self.quorum,
            _ => 1,
        };
        let position = action.position;
        let request = Request::Learned(action);
        let local = self.network.local();
        let mut waiting: Vec<ReplicaId> = self
            .network
            .members()
            .into_iter()
            .filter(|id| *id != local)
            .collect();
        let mut acked = 1;

        loop {
            let mut broadcast =
                Broadcast::send(&self.network, waiting.clone(), &request, deadline);
            while let Some((from, response)) = broadcast.next().await {
                if response == Response::Ack {
                    acked += 1;
                    waiting.retain(|id| *id != from);
                }
            }

            if acked >= required {
                return Ok(());
            }
            let delay = self.election_backoff;
            if Instant::now() + delay >= deadline {
                return Err(Error::Timeout(format!(
                    "commit of position {} acknowledged by {} of {} replicas",
                    position, acked, required
                )));
            }
            tracing::debug!(
                "Commit of position {} acknowledged by {} of {}, resending",
                position,
                acked,
                required
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Step down; later calls fail until a new election.
    pub async fn demote(&mut self) {
        if let Some(ballot) = self.ballot.take() {
            tracing::info!(
                "Replica {} stepping down from ballot {}",
                self.replica.id(),
                ballot
            );
        }
        self.pending = None;
        self.replica.demote().await;
    }
}
