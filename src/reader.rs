//! Quorum reads
//!
//! A read of `[from, to]` asks every member for its copy of the range and
//! needs a quorum of answers. A position is settled when some responder has
//! it learned, or when a quorum of responders accepted the same ballot for
//! it. Responders that lacked a settled value are sent the learned copy.

use crate::common::protocol::{ReadRequest, ReadResponse, Request, Response};
use crate::common::{Action, ActionKind, Error, ReplicaId, Result};
use crate::network::{Broadcast, Network};
use crate::position::{Entry, Position};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;

pub(crate) async fn read(
    network: &Arc<dyn Network>,
    quorum: usize,
    from: u64,
    to: u64,
    deadline: Instant,
) -> Result<Vec<Entry>> {
    if from > to {
        return Err(Error::OperationFailed(format!(
            "invalid range: {} is after {}",
            from, to
        )));
    }

    let responses = gather(network, quorum, from, to, deadline).await?;

    let beginning = responses.values().map(|r| r.beginning).max().unwrap_or(0);
    let ending = responses.values().filter_map(|r| r.ending).max();
    if from < beginning {
        return Err(Error::OperationFailed(format!(
            "position {} was truncated, log begins at {}",
            from, beginning
        )));
    }
    match ending {
        Some(ending) if to <= ending => {}
        _ => {
            return Err(Error::OperationFailed(format!(
                "position {} is beyond the end of the log ({:?})",
                to, ending
            )));
        }
    }

    let indexed: Vec<(ReplicaId, BTreeMap<u64, &Action>)> = responses
        .iter()
        .map(|(id, r)| (*id, r.actions.iter().map(|a| (a.position, a)).collect()))
        .collect();

    let mut settled = Vec::new();
    let mut laggards: Vec<(Action, Vec<ReplicaId>)> = Vec::new();
    for position in from..=to {
        let copies: Vec<(ReplicaId, &Action)> = indexed
            .iter()
            .filter_map(|(id, actions)| actions.get(&position).map(|a| (*id, *a)))
            .collect();

        let action = resolve(position, &copies, quorum)?;
        let behind: Vec<ReplicaId> = responses
            .keys()
            .filter(|id| {
                !copies
                    .iter()
                    .any(|(holder, a)| holder == *id && a.learned && a.kind == action.kind)
            })
            .copied()
            .collect();
        if !behind.is_empty() {
            laggards.push((action.clone(), behind));
        }
        settled.push(action);
    }

    if !laggards.is_empty() {
        tracing::debug!("Sending {} learned actions to lagging replicas", laggards.len());
        for (action, targets) in laggards {
            let request = Request::Learned(action);
            let mut broadcast = Broadcast::send(network, targets, &request, deadline);
            while broadcast.next().await.is_some() {}
        }
    }

    Ok(settled
        .into_iter()
        .filter_map(|action| match action.kind {
            Some(ActionKind::Append(data)) => Some(Entry::new(Position::new(action.position), data)),
            _ => None,
        })
        .collect())
}

async fn gather(
    network: &Arc<dyn Network>,
    quorum: usize,
    from: u64,
    to: u64,
    deadline: Instant,
) -> Result<BTreeMap<ReplicaId, ReadResponse>> {
    let request = Request::Read(ReadRequest { from, to });
    let mut broadcast = Broadcast::to_all(network, &request, deadline);

    let mut responses = BTreeMap::new();
    while responses.len() < quorum {
        match broadcast.next().await {
            Some((id, Response::Read(response))) => {
                responses.insert(id, response);
            }
            Some((id, other)) => {
                tracing::warn!("Unexpected read reply from {}: {:?}", id, other);
            }
            None => {
                return Err(Error::Timeout(format!(
                    "read of [{}, {}] answered by {} of {} replicas",
                    from,
                    to,
                    responses.len(),
                    quorum
                )));
            }
        }
    }
    for (id, response) in broadcast.ready() {
        if let Response::Read(response) = response {
            responses.insert(id, response);
        }
    }
    Ok(responses)
}

/// Pick the committed action for `position` among the responders' copies.
fn resolve(position: u64, copies: &[(ReplicaId, &Action)], quorum: usize) -> Result<Action> {
    if let Some((_, learned)) = copies.iter().find(|(_, a)| a.learned && a.kind.is_some()) {
        return Ok((*learned).clone().learned());
    }

    let mut votes: HashMap<_, (usize, &Action)> = HashMap::new();
    for (_, action) in copies {
        if action.kind.is_none() {
            continue;
        }
        votes.entry(action.performed).or_insert((0, *action)).0 += 1;
    }

    votes
        .into_values()
        .find(|(count, _)| *count >= quorum)
        .map(|(_, action)| action.clone().learned())
        .ok_or_else(|| {
            Error::OperationFailed(format!("position {} is not committed yet", position))
        })
}
