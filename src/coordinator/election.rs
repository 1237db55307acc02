//! Election and recovery of a new writer
//!
//! A candidate asks every member to promise a ballot above anything it has
//! seen. With a quorum of grants it learns the highest position any of them
//! stored, then fills every position it cannot confirm locally before the
//! first append is served.

use super::Coordinator;
use crate::common::protocol::{PromiseRequest, PromiseResponse, Request, Response};
use crate::common::{Action, ActionKind, Ballot, Error, Result};
use crate::network::Broadcast;
use std::time::Duration;
use tokio::time::Instant;

enum Vote {
    /// A quorum promised; highest position stored among the grants
    Granted(Option<u64>),
    Rejected(Ballot),
}

impl Coordinator {
    /// Run elections until one succeeds or `deadline` passes.
    ///
    /// Returns the first position the new writer will assign.
    pub async fn elect(&mut self, deadline: Instant) -> Result<u64> {
        self.ballot = None;
        self.pending = None;

        let id = self.replica.id();
        let mut seen = self.replica.promised().await;

        loop {
            let ballot = seen.successor(id);
            match self.solicit(ballot, deadline).await? {
                Vote::Granted(highest) => return self.recover(ballot, highest, deadline).await,
                Vote::Rejected(promised) => {
                    seen = seen.max(promised);
                    let delay = self.backoff_delay();
                    if Instant::now() + delay >= deadline {
                        return Err(Error::Timeout(format!(
                            "election lost to ballot {} before the deadline",
                            promised
                        )));
                    }
                    tracing::debug!(
                        "Ballot {} rejected (promised {}), retrying in {:?}",
                        ballot,
                        promised,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff_delay(&self) -> Duration {
        let base = self.election_backoff.as_millis() as u64;
        Duration::from_millis(base + rand::random::<u64>() % (base + 1))
    }

    async fn solicit(&self, ballot: Ballot, deadline: Instant) -> Result<Vote> {
        let request = Request::Promise(PromiseRequest {
            ballot,
            position: None,
        });
        let mut broadcast = Broadcast::to_all(&self.network, &request, deadline);

        let mut granted = 0;
        let mut highest = None;
        while granted < self.quorum {
            match broadcast.next().await {
                Some((_, Response::Promise(PromiseResponse::Granted { ending, .. }))) => {
                    granted += 1;
                    highest = highest.max(ending);
                }
                Some((_, Response::Promise(PromiseResponse::Rejected { promised }))) => {
                    return Ok(Vote::Rejected(promised));
                }
                Some((from, other)) => {
                    tracing::warn!("Unexpected promise reply from {}: {:?}", from, other);
                }
                None => {
                    return Err(Error::Timeout(format!(
                        "ballot {} granted by {} of {} replicas",
                        ballot, granted, self.quorum
                    )));
                }
            }
        }

        // Late grants still tell us about positions we must not skip.
        for (_, response) in broadcast.ready() {
            if let Response::Promise(PromiseResponse::Granted { ending, .. }) = response {
                highest = highest.max(ending);
            }
        }

        Ok(Vote::Granted(highest))
    }

    async fn recover(
        &mut self,
        ballot: Ballot,
        highest: Option<u64>,
        deadline: Instant,
    ) -> Result<u64> {
        if !self.replica.elected(ballot).await {
            return Err(Error::WriterFailed(format!(
                "replica {} cannot coordinate ballot {}",
                self.replica.id(),
                ballot
            )));
        }
        self.ballot = Some(ballot);
        tracing::info!("Replica {} elected with ballot {}", self.replica.id(), ballot);

        match self.fill_missing(highest, deadline).await {
            Ok(index) => {
                self.index = index;
                tracing::info!(
                    "Replica {} recovered log up to position {}",
                    self.replica.id(),
                    index
                );
                Ok(index)
            }
            Err(e) => {
                self.demote().await;
                Err(e)
            }
        }
    }

    async fn fill_missing(&mut self, highest: Option<u64>, deadline: Instant) -> Result<u64> {
        let highest = highest.max(self.replica.ending().await);
        let Some(highest) = highest else {
            return Ok(self.replica.beginning().await);
        };

        for position in self.replica.missing(highest).await {
            // A learned truncation may have moved the beginning past it.
            if position < self.replica.beginning().await {
                continue;
            }
            self.fill(position, deadline).await?;
        }
        Ok(highest + 1)
    }

    /// Settle `position`: adopt a committed value if one exists, otherwise
    /// re-propose the highest-ballot proposal, otherwise a no-op.
    async fn fill(&mut self, position: u64, deadline: Instant) -> Result<()> {
        let ballot = self.elected_ballot()?;
        let request = Request::Promise(PromiseRequest {
            ballot,
            position: Some(position),
        });
        let mut broadcast = Broadcast::to_all(&self.network, &request, deadline);

        let mut granted = 0;
        let mut actions = Vec::new();
        while granted < self.quorum {
            match broadcast.next().await {
                Some((_, Response::Promise(PromiseResponse::Granted { action, .. }))) => {
                    granted += 1;
                    actions.extend(action);
                }
                Some((_, Response::Promise(PromiseResponse::Rejected { promised }))) => {
                    self.demote().await;
                    return Err(Error::WriterFailed(format!(
                        "ballot {} superseded by {} while filling position {}",
                        ballot, promised, position
                    )));
                }
                Some((from, other)) => {
                    tracing::warn!("Unexpected promise reply from {}: {:?}", from, other);
                }
                None => {
                    return Err(Error::Timeout(format!(
                        "recovery of position {} granted by {} of {} replicas",
                        position, granted, self.quorum
                    )));
                }
            }
        }
        for (_, response) in broadcast.ready() {
            if let Response::Promise(PromiseResponse::Granted { action, .. }) = response {
                actions.extend(action);
            }
        }

        let actions: Vec<Action> = actions.into_iter().filter(|a| a.kind.is_some()).collect();

        if let Some(learned) = actions.iter().find(|a| a.learned) {
            tracing::debug!("Position {} already committed elsewhere", position);
            return self.commit(learned.clone(), deadline).await;
        }

        let kind = actions
            .iter()
            .max_by_key(|a| a.performed)
            .and_then(|a| a.kind.clone())
            .unwrap_or(ActionKind::Nop);
        tracing::info!("Filling position {} with {}", position, kind.name());

        self.write(ballot, position, kind.clone(), deadline).await?;
        self.commit(Action::proposal(position, ballot, kind), deadline)
            .await
    }
}
