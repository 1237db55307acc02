//! Message transport between replicas
//!
//! The log engine only needs [`Network`]: who am I, who is in the group, and
//! a request/response call to one member. [`LocalCluster`] hosts a whole
//! group in one process and can cut links between members, which is what
//! the tests and the CLI demo run on.

use crate::common::protocol::{MessageKind, Request, Response};
use crate::common::{Error, LogConfig, ReplicaId, Result};
use crate::log::Log;
use crate::replica::Replica;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;

/// Transport seam between a replica's log and its peers.
#[async_trait]
pub trait Network: Send + Sync {
    /// Id of the replica this endpoint belongs to.
    fn local(&self) -> ReplicaId;

    /// Every member of the group, including the local replica.
    fn members(&self) -> Vec<ReplicaId>;

    /// Deliver `request` to `to`. `Ok(None)` means the peer chose not to
    /// answer.
    async fn call(&self, to: ReplicaId, request: Request) -> Result<Option<Response>>;
}

type Reply = (ReplicaId, Result<Option<Response>>);

/// One request fanned out to several replicas, with replies collected as
/// they arrive.
pub struct Broadcast {
    pending: FuturesUnordered<BoxFuture<'static, Reply>>,
    deadline: Instant,
}

impl Broadcast {
    pub fn send(
        network: &Arc<dyn Network>,
        targets: impl IntoIterator<Item = ReplicaId>,
        request: &Request,
        deadline: Instant,
    ) -> Self {
        let pending = FuturesUnordered::new();
        for to in targets {
            let network = network.clone();
            let request = request.clone();
            pending.push(async move { (to, network.call(to, request).await) }.boxed());
        }
        Self { pending, deadline }
    }

    /// Send to every member, including the local replica.
    pub fn to_all(network: &Arc<dyn Network>, request: &Request, deadline: Instant) -> Self {
        Self::send(network, network.members(), request, deadline)
    }

    /// Send to every member except the local replica.
    pub fn to_others(network: &Arc<dyn Network>, request: &Request, deadline: Instant) -> Self {
        let local = network.local();
        let targets = network.members().into_iter().filter(|id| *id != local);
        Self::send(network, targets, request, deadline)
    }

    /// Replies still outstanding.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Next reply, or `None` once every target answered, failed or stayed
    /// silent, or the deadline passed.
    pub async fn next(&mut self) -> Option<(ReplicaId, Response)> {
        loop {
            match tokio::time::timeout_at(self.deadline, self.pending.next()).await {
                Err(_) | Ok(None) => return None,
                Ok(Some(reply)) => {
                    if let Some(response) = Self::accept(reply) {
                        return Some(response);
                    }
                }
            }
        }
    }

    /// Replies that are available without waiting.
    pub fn ready(&mut self) -> Vec<(ReplicaId, Response)> {
        let mut responses = Vec::new();
        while let Some(Some(reply)) = self.pending.next().now_or_never() {
            responses.extend(Self::accept(reply));
        }
        responses
    }

    fn accept((from, reply): Reply) -> Option<(ReplicaId, Response)> {
        match reply {
            Ok(Some(response)) => Some((from, response)),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("No reply from replica {}: {}", from, e);
                None
            }
        }
    }
}

#[derive(Default)]
struct Links {
    blocked: HashSet<(ReplicaId, ReplicaId)>,
    filtered: HashSet<(ReplicaId, ReplicaId, MessageKind)>,
}

impl Links {
    fn allows(&self, from: ReplicaId, to: ReplicaId, kind: MessageKind) -> bool {
        !self.blocked.contains(&(from, to)) && !self.filtered.contains(&(from, to, kind))
    }
}

struct ClusterInner {
    members: Vec<ReplicaId>,
    replicas: RwLock<HashMap<ReplicaId, Arc<Replica>>>,
    links: RwLock<Links>,
}

/// In-process group of replicas with controllable links.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    pub fn new(members: Vec<ReplicaId>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                members,
                replicas: RwLock::new(HashMap::new()),
                links: RwLock::new(Links::default()),
            }),
        }
    }

    pub fn members(&self) -> Vec<ReplicaId> {
        self.inner.members.clone()
    }

    /// Make `replica` reachable.
    pub fn register(&self, replica: Arc<Replica>) {
        let mut replicas = self
            .inner
            .replicas
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        replicas.insert(replica.id(), replica);
    }

    /// Take a replica off the network, as if its process crashed.
    pub fn remove(&self, id: ReplicaId) -> Option<Arc<Replica>> {
        self.inner
            .replicas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn replica(&self, id: ReplicaId) -> Option<Arc<Replica>> {
        self.inner
            .replicas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Endpoint for replica `origin`.
    pub fn network(&self, origin: ReplicaId) -> Arc<dyn Network> {
        Arc::new(LocalNetwork {
            origin,
            cluster: self.clone(),
        })
    }

    fn with_links<T>(&self, f: impl FnOnce(&mut Links) -> T) -> T {
        let mut links = self
            .inner
            .links
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut links)
    }

    /// Drop every message sent from `from` to `to`.
    pub fn block(&self, from: ReplicaId, to: ReplicaId) {
        self.with_links(|links| links.blocked.insert((from, to)));
    }

    pub fn unblock(&self, from: ReplicaId, to: ReplicaId) {
        self.with_links(|links| links.blocked.remove(&(from, to)));
    }

    /// Drop messages of one kind sent from `from` to `to`.
    pub fn block_kind(&self, from: ReplicaId, to: ReplicaId, kind: MessageKind) {
        self.with_links(|links| links.filtered.insert((from, to, kind)));
    }

    /// Cut `id` off from every other member, both ways.
    pub fn isolate(&self, id: ReplicaId) {
        let members = self.members();
        self.with_links(|links| {
            for other in members.into_iter().filter(|other| *other != id) {
                links.blocked.insert((id, other));
                links.blocked.insert((other, id));
            }
        });
    }

    /// Restore every link.
    pub fn heal(&self) {
        self.with_links(|links| *links = Links::default());
    }

    /// Open the log of one member and put its replica on the network before
    /// catch-up runs.
    pub async fn open_log(&self, config: LogConfig) -> Result<Log> {
        config.validate()?;
        let replica = Arc::new(Replica::open(
            config.replica_id,
            &config.data_dir,
            config.wal_sync,
            config.bootstrap,
        )?);
        self.register(replica.clone());
        let network = self.network(config.replica_id);
        Log::open_with(config, replica, network).await
    }

    async fn deliver(
        &self,
        from: ReplicaId,
        to: ReplicaId,
        request: Request,
    ) -> Result<Option<Response>> {
        let kind = request.kind();
        let allowed = self
            .inner
            .links
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .allows(from, to, kind);
        if !allowed {
            return Err(Error::ConnectionFailed(format!(
                "link {} -> {} blocked for {:?}",
                from, to, kind
            )));
        }

        let replica = self
            .replica(to)
            .ok_or_else(|| Error::ConnectionFailed(format!("replica {} unreachable", to)))?;
        Ok(replica.handle(request).await)
    }
}

/// A replica's endpoint into a [`LocalCluster`].
pub struct LocalNetwork {
    origin: ReplicaId,
    cluster: LocalCluster,
}

#[async_trait]
impl Network for LocalNetwork {
    fn local(&self) -> ReplicaId {
        self.origin
    }

    fn members(&self) -> Vec<ReplicaId> {
        self.cluster.members()
    }

    async fn call(&self, to: ReplicaId, request: Request) -> Result<Option<Response>> {
        self.cluster.deliver(self.origin, to, request).await
    }
}
