//! Catch-up of a lagging or fresh replica
//!
//! The replica stops voting, asks every peer for its state from the local
//! beginning onwards and waits for a quorum of voting peers. It then adopts
//! the highest promise and beginning seen, copies each position it lacks
//! (learned copies first, otherwise the proposal under the highest ballot)
//! and rejoins the group as a follower.

use super::Replica;
use crate::common::protocol::{CatchupRequest, CatchupResponse, Request, Response};
use crate::common::{deadline_after, Action, Ballot, Error, Membership, Result};
use crate::network::{Broadcast, Network};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// What a completed catch-up changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchupReport {
    pub responders: usize,
    pub applied: usize,
    pub beginning: u64,
    pub ending: Option<u64>,
}

pub async fn catchup(
    replica: &Replica,
    network: &Arc<dyn Network>,
    quorum: usize,
    timeout: Duration,
) -> Result<CatchupReport> {
    let deadline = deadline_after(timeout);
    replica.enter_catchup().await?;

    let from = replica.beginning().await;
    tracing::info!("Replica {} catching up from position {}", replica.id(), from);

    let request = Request::Catchup(CatchupRequest { from });
    let mut broadcast = Broadcast::to_others(network, &request, deadline);

    let mut responses = Vec::new();
    while responses.len() < quorum {
        match broadcast.next().await {
            Some((from, Response::Catchup(response))) => {
                if response.membership == Membership::Voting {
                    responses.push(response);
                } else {
                    tracing::debug!("Replica {} is not voting ({})", from, response.membership);
                }
            }
            Some((from, other)) => {
                tracing::warn!("Unexpected catch-up reply from {}: {:?}", from, other);
            }
            None => break,
        }
    }

    if responses.len() < quorum {
        return Err(Error::Timeout(format!(
            "catch-up reached {} of {} voting replicas",
            responses.len(),
            quorum
        )));
    }

    for (_, response) in broadcast.ready() {
        if let Response::Catchup(response) = response {
            if response.membership == Membership::Voting {
                responses.push(response);
            }
        }
    }

    let merged = merge(&responses);
    let applied = replica
        .complete_catchup(merged.promised, merged.beginning, merged.actions)
        .await?;

    let report = CatchupReport {
        responders: responses.len(),
        applied,
        beginning: replica.beginning().await,
        ending: replica.ending().await,
    };
    tracing::info!(
        "Replica {} caught up: {} actions applied from {} replicas, range [{}, {:?}]",
        replica.id(),
        report.applied,
        report.responders,
        report.beginning,
        report.ending
    );
    Ok(report)
}

struct Merged {
    promised: Ballot,
    beginning: u64,
    actions: Vec<Action>,
}

/// Fold peer states into the best known action per position.
fn merge(responses: &[CatchupResponse]) -> Merged {
    let promised = responses
        .iter()
        .map(|r| r.promised)
        .max()
        .unwrap_or(Ballot::ZERO);
    let beginning = responses.iter().map(|r| r.beginning).max().unwrap_or(0);

    let mut best: BTreeMap<u64, &Action> = BTreeMap::new();
    for action in responses.iter().flat_map(|r| r.actions.iter()) {
        if action.position < beginning || action.kind.is_none() {
            continue;
        }
        best.entry(action.position)
            .and_modify(|current| {
                if supersedes(action, *current) {
                    *current = action;
                }
            })
            .or_insert(action);
    }

    Merged {
        promised,
        beginning,
        actions: best.into_values().cloned().collect(),
    }
}

/// Learned beats unlearned; among unlearned, the higher ballot wins.
pub(crate) fn supersedes(candidate: &Action, current: &Action) -> bool {
    match (candidate.learned, current.learned) {
        (true, false) => true,
        (false, false) => candidate.performed > current.performed,
        _ => false,
    }
}
