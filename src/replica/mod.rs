//! Replica: one member's durable state plus its protocol handler
//!
//! A replica answers promise, write, learned, read and catch-up requests
//! against its [`LocalStore`]. Requests are handled one at a time: the store
//! and the runtime status live behind a single async mutex.

pub mod catchup;
pub mod store;
pub mod wal;

pub use store::{LocalStore, StoreSummary};

use crate::common::protocol::{
    CatchupRequest, CatchupResponse, PromiseRequest, PromiseResponse, ReadRequest, ReadResponse,
    Request, Response, WriteRequest, WriteResponse,
};
use crate::common::{Action, Ballot, Membership, ReplicaId, Result, WalSyncPolicy};
use std::fmt;
use std::path::Path;
use tokio::sync::{Mutex, Notify};

/// Runtime role of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    /// Fresh store, never joined the group
    Empty,
    /// Copying committed state from peers
    CatchingUp,
    Follower,
    /// Hosts the writer of the current ballot
    Coordinator,
}

impl ReplicaStatus {
    /// Whether the replica votes in elections and write quorums.
    pub fn participates(&self) -> bool {
        matches!(self, ReplicaStatus::Follower | ReplicaStatus::Coordinator)
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaStatus::Empty => write!(f, "empty"),
            ReplicaStatus::CatchingUp => write!(f, "catching-up"),
            ReplicaStatus::Follower => write!(f, "follower"),
            ReplicaStatus::Coordinator => write!(f, "coordinator"),
        }
    }
}

struct ReplicaState {
    store: LocalStore,
    status: ReplicaStatus,
    /// Ballot of the writer hosted here, while it is current
    coordinating: Option<Ballot>,
}

impl ReplicaState {
    /// A higher ballot was promised: any writer hosted here is stale.
    fn observe(&mut self, ballot: Ballot, id: ReplicaId) {
        if let Some(current) = self.coordinating {
            if ballot > current {
                tracing::info!(
                    "Replica {} demoted: ballot {} superseded by {}",
                    id,
                    current,
                    ballot
                );
                self.coordinating = None;
                if self.status == ReplicaStatus::Coordinator {
                    self.status = ReplicaStatus::Follower;
                }
            }
        }
    }

    /// A participating replica handed `position` while positions before it
    /// were never stored here.
    fn skips_ahead(&self, position: u64) -> bool {
        let next = self
            .store
            .ending()
            .map_or(self.store.beginning(), |ending| ending + 1);
        self.status.participates() && position > next
    }
}

pub struct Replica {
    id: ReplicaId,
    state: Mutex<ReplicaState>,
    /// Signalled when a request skips past the local ending
    gap: Notify,
}

impl Replica {
    /// Open the replica stored in `dir`.
    ///
    /// With `bootstrap`, a store that never joined a group becomes a voting
    /// member right away (initial group formation).
    pub fn open(
        id: ReplicaId,
        dir: impl AsRef<Path>,
        sync_policy: WalSyncPolicy,
        bootstrap: bool,
    ) -> Result<Self> {
        let mut store = LocalStore::open(dir, sync_policy)?;

        if bootstrap && store.membership() == Membership::Empty {
            store.set_membership(Membership::Voting)?;
        }

        let status = match store.membership() {
            Membership::Empty => ReplicaStatus::Empty,
            Membership::Recovering => ReplicaStatus::CatchingUp,
            Membership::Voting => ReplicaStatus::Follower,
        };

        tracing::info!(
            "Replica {} recovered: {}, beginning {}, ending {:?}, promised {}",
            id,
            status,
            store.beginning(),
            store.ending(),
            store.promised()
        );

        Ok(Self {
            id,
            state: Mutex::new(ReplicaState {
                store,
                status,
                coordinating: None,
            }),
            gap: Notify::new(),
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub async fn status(&self) -> ReplicaStatus {
        self.state.lock().await.status
    }

    pub async fn membership(&self) -> Membership {
        self.state.lock().await.store.membership()
    }

    pub async fn promised(&self) -> Ballot {
        self.state.lock().await.store.promised()
    }

    pub async fn beginning(&self) -> u64 {
        self.state.lock().await.store.beginning()
    }

    pub async fn ending(&self) -> Option<u64> {
        self.state.lock().await.store.ending()
    }

    pub async fn get(&self, position: u64) -> Result<Action> {
        self.state.lock().await.store.get(position)
    }

    pub async fn range(&self, from: u64, to: u64) -> Vec<Action> {
        self.state.lock().await.store.range(from, to)
    }

    /// Positions in `[beginning, to]` not learned locally.
    pub async fn missing(&self, to: u64) -> Vec<u64> {
        self.state.lock().await.store.missing(to)
    }

    pub async fn summary(&self) -> StoreSummary {
        self.state.lock().await.store.summary()
    }

    pub async fn compact(&self) -> Result<usize> {
        self.state.lock().await.store.compact()
    }

    pub async fn sync(&self) -> Result<()> {
        self.state.lock().await.store.sync()
    }

    /// Record a committed action locally.
    pub async fn learn(&self, action: Action) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::store_learned(&mut state.store, action)
    }

    fn store_learned(store: &mut LocalStore, action: Action) -> Result<()> {
        let action = action.learned();
        if store.lookup(action.position) == Some(&action) {
            return Ok(());
        }
        if store.put(action.clone())? {
            tracing::debug!(
                "Learned {} action at position {}",
                action.kind.as_ref().map_or("empty", |k| k.name()),
                action.position
            );
        }
        Ok(())
    }

    /// Take the coordinator role for `ballot`, unless it was already
    /// superseded locally.
    pub(crate) async fn elected(&self, ballot: Ballot) -> bool {
        let mut state = self.state.lock().await;
        if state.store.promised() > ballot || !state.status.participates() {
            return false;
        }
        state.coordinating = Some(ballot);
        state.status = ReplicaStatus::Coordinator;
        true
    }

    /// Give up the coordinator role.
    pub async fn demote(&self) {
        let mut state = self.state.lock().await;
        state.coordinating = None;
        if state.status == ReplicaStatus::Coordinator {
            state.status = ReplicaStatus::Follower;
        }
    }

    /// Handle one protocol request. `None` means no reply is sent.
    pub async fn handle(&self, request: Request) -> Option<Response> {
        let kind = request.kind();
        let mut state = self.state.lock().await;

        let result = match request {
            Request::Promise(request) => self.promise(&mut state, request),
            Request::Write(request) => self.write(&mut state, request),
            Request::Learned(action) => {
                self.check_gap(&state, action.position);
                Self::store_learned(&mut state.store, action).map(|_| Some(Response::Ack))
            }
            Request::Read(request) => Ok(self.read(&state, request)),
            Request::Catchup(request) => Ok(Some(Self::catchup(&state, request))),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Replica {} failed to handle {:?}: {}", self.id, kind, e);
                None
            }
        }
    }

    fn check_gap(&self, state: &ReplicaState, position: u64) {
        if state.skips_ahead(position) {
            tracing::debug!(
                "Replica {} missed positions before {} (ending {:?})",
                self.id,
                position,
                state.store.ending()
            );
            self.gap.notify_one();
        }
    }

    /// Resolves once a write or learned action skipped past the local
    /// ending. A gap seen before the call is not lost.
    pub async fn gap_detected(&self) {
        self.gap.notified().await
    }

    fn promise(&self, state: &mut ReplicaState, request: PromiseRequest) -> Result<Option<Response>> {
        if !state.status.participates() {
            tracing::debug!(
                "Replica {} ({}) ignoring promise request for {}",
                self.id,
                state.status,
                request.ballot
            );
            return Ok(None);
        }

        let promised = state.store.promised();
        let response = match request.position {
            None if request.ballot > promised => {
                state.store.promise(request.ballot)?;
                state.observe(request.ballot, self.id);
                tracing::debug!("Replica {} promised {}", self.id, request.ballot);
                PromiseResponse::Granted {
                    ballot: request.ballot,
                    ending: state.store.ending(),
                    action: None,
                }
            }
            Some(position) if request.ballot >= promised => {
                state.store.promise(request.ballot)?;
                state.observe(request.ballot, self.id);
                PromiseResponse::Granted {
                    ballot: request.ballot,
                    ending: state.store.ending(),
                    action: state.store.lookup(position).cloned(),
                }
            }
            _ => {
                tracing::debug!(
                    "Replica {} rejected {}, promised {}",
                    self.id,
                    request.ballot,
                    promised
                );
                PromiseResponse::Rejected { promised }
            }
        };

        Ok(Some(Response::Promise(response)))
    }

    fn write(&self, state: &mut ReplicaState, request: WriteRequest) -> Result<Option<Response>> {
        if !state.status.participates() {
            tracing::debug!(
                "Replica {} ({}) ignoring write at {}",
                self.id,
                state.status,
                request.position
            );
            return Ok(None);
        }

        let promised = state.store.promised();
        if request.ballot < promised {
            return Ok(Some(Response::Write(WriteResponse::Rejected { promised })));
        }

        let accepted = Response::Write(WriteResponse::Accepted {
            ballot: request.ballot,
            position: request.position,
        });

        // Truncated positions are moot; acknowledge without storing.
        if request.position < state.store.beginning() {
            return Ok(Some(accepted));
        }

        if let Some(existing) = state.store.lookup(request.position) {
            if existing.learned {
                if existing.kind.as_ref() == Some(&request.kind) {
                    return Ok(Some(accepted));
                }
                tracing::warn!(
                    "Replica {} ignoring conflicting write at learned position {}",
                    self.id,
                    request.position
                );
                return Ok(None);
            }
        }

        self.check_gap(state, request.position);
        state.store.promise(request.ballot)?;
        state.observe(request.ballot, self.id);
        state.store.put(Action::proposal(
            request.position,
            request.ballot,
            request.kind,
        ))?;

        Ok(Some(accepted))
    }

    fn read(&self, state: &ReplicaState, request: ReadRequest) -> Option<Response> {
        if !state.status.participates() {
            return None;
        }
        let from = request.from.max(state.store.beginning());
        Some(Response::Read(ReadResponse {
            beginning: state.store.beginning(),
            ending: state.store.ending(),
            actions: state.store.range(from, request.to),
        }))
    }

    fn catchup(state: &ReplicaState, request: CatchupRequest) -> Response {
        let store = &state.store;
        let actions = match store.ending() {
            Some(ending) => store.range(request.from.max(store.beginning()), ending),
            None => Vec::new(),
        };
        Response::Catchup(CatchupResponse {
            membership: store.membership(),
            promised: store.promised(),
            beginning: store.beginning(),
            ending: store.ending(),
            actions,
        })
    }

    /// Stop voting while the local state is being rebuilt.
    pub(crate) async fn enter_catchup(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.store.membership() != Membership::Voting {
            state.store.set_membership(Membership::Recovering)?;
        }
        state.coordinating = None;
        state.status = ReplicaStatus::CatchingUp;
        Ok(())
    }

    /// Apply state gathered from peers and rejoin the group.
    pub(crate) async fn complete_catchup(
        &self,
        promised: Ballot,
        beginning: u64,
        actions: Vec<Action>,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        let store = &mut state.store;

        store.promise(promised)?;
        store.truncate(beginning)?;

        let mut applied = 0;
        for action in actions {
            let newer = store
                .lookup(action.position)
                .map_or(true, |current| catchup::supersedes(&action, current));
            if !newer {
                continue;
            }
            if store.put(action)? {
                applied += 1;
            }
        }

        store.set_membership(Membership::Voting)?;
        state.status = ReplicaStatus::Follower;
        Ok(applied)
    }
}
