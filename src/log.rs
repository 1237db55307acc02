//! Log façade
//!
//! [`Log`] owns the local replica and its network endpoint. [`Reader`] and
//! [`Writer`] handles only keep a weak reference: once the log is closed or
//! dropped they fail with [`Error::LogClosed`] instead of keeping it alive.
//!
//! Every blocking call takes an explicit timeout.
//!
//! While a log is open, a background task catches the local replica up
//! whenever it is handed a position past its local ending.

use crate::common::{
    deadline_after, retry_with_backoff, Ballot, Error, LogConfig, Membership, Result,
};
use crate::coordinator::Coordinator;
use crate::network::Network;
use crate::position::{Entry, Position};
use crate::reader;
use crate::replica::catchup::{self, CatchupReport};
use crate::replica::Replica;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub(crate) struct LogInner {
    config: LogConfig,
    replica: Arc<Replica>,
    network: Arc<dyn Network>,
}

/// One member's view of the replicated log.
pub struct Log {
    inner: Arc<LogInner>,
    gaps: JoinHandle<()>,
}

impl Log {
    /// Open the local replica and join the group through `network`.
    pub async fn open(config: LogConfig, network: Arc<dyn Network>) -> Result<Self> {
        config.validate()?;
        let replica = Arc::new(Replica::open(
            config.replica_id,
            &config.data_dir,
            config.wal_sync,
            config.bootstrap,
        )?);
        Self::open_with(config, replica, network).await
    }

    /// Open around an already opened replica.
    ///
    /// A replica that is not a voting member catches up first. If that fails
    /// the log still opens; the replica stays out of quorums until
    /// [`Log::catchup`] succeeds.
    pub async fn open_with(
        config: LogConfig,
        replica: Arc<Replica>,
        network: Arc<dyn Network>,
    ) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(LogInner {
            config,
            replica,
            network,
        });
        let gaps = tokio::spawn(watch_gaps(inner.replica.clone(), Arc::downgrade(&inner)));
        let log = Self { inner, gaps };

        if log.inner.replica.membership().await != Membership::Voting {
            let timeout = log.inner.config.catchup_timeout();
            if let Err(e) = log.catchup(timeout).await {
                tracing::warn!(
                    "Replica {} could not catch up yet: {}",
                    log.inner.replica.id(),
                    e
                );
            }
        }

        Ok(log)
    }

    pub fn config(&self) -> &LogConfig {
        &self.inner.config
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.inner.replica
    }

    /// Rebuild a position from its identity bytes.
    pub fn position(&self, identity: &[u8]) -> Result<Position> {
        Position::from_identity(identity)
    }

    pub fn reader(&self) -> Reader {
        Reader {
            log: Arc::downgrade(&self.inner),
        }
    }

    /// Elect a writer, retrying transient failures up to `retries` times.
    pub async fn writer(&self, timeout: Duration, retries: usize) -> Result<Writer> {
        let inner = &self.inner;
        let coordinator = retry_with_backoff(
            || {
                let inner = inner.clone();
                async move {
                    let mut coordinator = Coordinator::new(
                        inner.replica.clone(),
                        inner.network.clone(),
                        inner.config.quorum,
                        inner.config.election_backoff(),
                    );
                    coordinator.elect(deadline_after(timeout)).await?;
                    Ok(coordinator)
                }
            },
            retries.max(1),
            inner.config.election_backoff(),
        )
        .await?;

        Ok(Writer {
            log: Arc::downgrade(&self.inner),
            state: Mutex::new(WriterState {
                coordinator,
                failure: None,
            }),
        })
    }

    /// Copy committed state from the group into the local replica.
    pub async fn catchup(&self, timeout: Duration) -> Result<CatchupReport> {
        catchup::catchup(
            &self.inner.replica,
            &self.inner.network,
            self.inner.config.quorum,
            timeout,
        )
        .await
    }

    /// Flush the local replica and release the log. Outstanding readers and
    /// writers fail with [`Error::LogClosed`] afterwards.
    pub async fn close(self) -> Result<()> {
        self.inner.replica.sync().await?;
        tracing::info!("Closed log of replica {}", self.inner.replica.id());
        Ok(())
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.gaps.abort();
    }
}

/// Run a catch-up each time the replica reports a gap, until it succeeds or
/// the log goes away.
async fn watch_gaps(replica: Arc<Replica>, log: Weak<LogInner>) {
    loop {
        replica.gap_detected().await;
        loop {
            let Some(inner) = log.upgrade() else {
                return;
            };
            let backoff = inner.config.election_backoff();
            match catchup::catchup(
                &inner.replica,
                &inner.network,
                inner.config.quorum,
                inner.config.catchup_timeout(),
            )
            .await
            {
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(
                        "Replica {} failed to fill its gap: {}",
                        inner.replica.id(),
                        e
                    );
                }
            }
            drop(inner);
            tokio::time::sleep(backoff).await;
        }
    }
}

fn upgrade(log: &Weak<LogInner>) -> Result<Arc<LogInner>> {
    log.upgrade().ok_or(Error::LogClosed)
}

/// Read-only handle; many may exist at once.
#[derive(Clone)]
pub struct Reader {
    log: Weak<LogInner>,
}

impl Reader {
    /// Committed entries in `[from, to]`. Positions holding no-ops or
    /// truncations are skipped.
    pub async fn read(&self, from: Position, to: Position, timeout: Duration) -> Result<Vec<Entry>> {
        let log = upgrade(&self.log)?;
        reader::read(
            &log.network,
            log.config.quorum,
            from.value(),
            to.value(),
            deadline_after(timeout),
        )
        .await
    }

    /// Lowest position not truncated, as known locally.
    pub async fn beginning(&self) -> Result<Position> {
        let log = upgrade(&self.log)?;
        Ok(Position::new(log.replica.beginning().await))
    }

    /// Highest position stored locally; the beginning when nothing is.
    pub async fn ending(&self) -> Result<Position> {
        let log = upgrade(&self.log)?;
        let replica = &log.replica;
        let ending = match replica.ending().await {
            Some(ending) => ending,
            None => replica.beginning().await,
        };
        Ok(Position::new(ending))
    }
}

struct WriterState {
    coordinator: Coordinator,
    /// Why the writer can no longer be used
    failure: Option<String>,
}

impl WriterState {
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.invalidates_writer() {
                self.failure = Some(e.to_string());
            }
        }
        result
    }
}

/// Exclusive append/truncate rights for one elected ballot.
pub struct Writer {
    log: Weak<LogInner>,
    state: Mutex<WriterState>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

impl Writer {
    /// Append `data`, returning its position.
    ///
    /// A [`Error::Timeout`] leaves the outcome unknown; the next call
    /// finishes the timed-out proposal first. Payloads larger than
    /// [`MAX_PAYLOAD_LEN`](crate::replica::wal::MAX_PAYLOAD_LEN) fail with
    /// [`Error::OperationFailed`] without being proposed.
    pub async fn append(&self, data: impl Into<Vec<u8>>, timeout: Duration) -> Result<Position> {
        let _log = upgrade(&self.log)?;
        let mut state = self.state.lock().await;
        if let Some(failure) = &state.failure {
            return Err(Error::WriterFailed(failure.clone()));
        }

        let result = state
            .coordinator
            .append(data.into(), deadline_after(timeout))
            .await;
        state.check(result).map(Position::new)
    }

    /// Delete everything before `to`, returning the new beginning.
    ///
    /// `to` past the next position fails with [`Error::OperationFailed`];
    /// the writer stays usable.
    pub async fn truncate(&self, to: Position, timeout: Duration) -> Result<Position> {
        let _log = upgrade(&self.log)?;
        let mut state = self.state.lock().await;
        if let Some(failure) = &state.failure {
            return Err(Error::WriterFailed(failure.clone()));
        }

        let result = state
            .coordinator
            .truncate(to.value(), deadline_after(timeout))
            .await;
        state.check(result).map(Position::new)
    }

    /// Ballot this writer was elected with, while it is still valid.
    pub async fn ballot(&self) -> Option<Ballot> {
        let state = self.state.lock().await;
        match state.failure {
            Some(_) => None,
            None => state.coordinator.ballot(),
        }
    }
}
