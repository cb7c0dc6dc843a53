//! Syncer State Machine
//!
//! This module provides the main orchestration logic for state sync:
//! - Selecting candidate snapshots from the pool and attesting them with
//!   the state provider
//! - Offering snapshots to the application engine and classifying its
//!   verdicts
//! - Running the concurrent chunk fetcher pool against the chunk queue
//! - Applying chunks to the engine strictly in order, driven by the
//!   engine's per-chunk responses
//! - Verifying the restored application against the attested reference
//!
//! ## Restore Flow
//!
//! [`Syncer::sync`] restores one specific snapshot: attest, offer, fetch and
//! apply all chunks, verify. [`Syncer::sync_any`] wraps it in the outer
//! retry loop that walks the snapshot pool, pausing to discover new
//! snapshots when the pool runs dry, until a restore succeeds or a
//! non-recoverable condition arises.
//!
//! Failures are classified per axis: a rejected snapshot only burns that
//! snapshot, a rejected format burns every snapshot in the format, a
//! rejected sender burns every peer that advertised the snapshot, and a
//! chunk delivery stall burns the snapshot. Aborts, verification failures,
//! and trust failures terminate the whole sync.

use crate::app::{
    ApplySnapshotChunkRequest, ApplySnapshotChunkResult, OfferSnapshotRequest,
    OfferSnapshotResponse, QueryConnection, SnapshotConnection,
};
use crate::chunks::{Chunk, ChunkQueue, ChunkQueueError, ChunkRequest};
use crate::provider::{BlockCommit, ProviderError, ReplicatedState, StateProvider};
use crate::snapshot::{Snapshot, SnapshotPool, SnapshotPoolError};
use crate::{
    PeerId, DEFAULT_CHUNK_FETCHERS, DEFAULT_CHUNK_REQUEST_TIMEOUT_SECS,
    MIN_CHUNK_REQUEST_TIMEOUT_SECS,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

/// Timeout while waiting for the next chunk from the chunk queue
const CHUNK_TIMEOUT: Duration = Duration::from_secs(120);

/// Lowest allowable discovery time for [`Syncer::sync_any`]
const MINIMUM_DISCOVERY_TIME: Duration = Duration::from_secs(5);

/// Deadline for each state provider request
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// How often an idle fetcher re-checks the queue for reopened slots
const ALLOCATE_RECHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for the syncer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncConfig {
    /// Number of concurrent chunk fetchers
    pub chunk_fetchers: u32,

    /// How long a fetcher waits for a requested chunk before re-requesting
    /// it from another peer
    pub chunk_request_timeout: Duration,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            chunk_fetchers: DEFAULT_CHUNK_FETCHERS,
            chunk_request_timeout: Duration::from_secs(DEFAULT_CHUNK_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl StateSyncConfig {
    /// Check the configuration values are usable
    pub fn validate(&self) -> Result<(), StateSyncError> {
        if self.chunk_fetchers == 0 {
            return Err(StateSyncError::Config(
                "chunk_fetchers must be at least 1".to_string(),
            ));
        }
        if self.chunk_request_timeout < Duration::from_secs(MIN_CHUNK_REQUEST_TIMEOUT_SECS) {
            return Err(StateSyncError::Config(format!(
                "chunk_request_timeout must be at least {}s",
                MIN_CHUNK_REQUEST_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

/// Errors that can occur during state synchronization
#[derive(Debug, thiserror::Error)]
pub enum StateSyncError {
    /// The application aborted state sync
    #[error("state sync aborted")]
    Aborted,

    /// The application asked for the current snapshot to be restarted
    #[error("snapshot restoration must be retried")]
    RetrySnapshot,

    /// The snapshot was rejected
    #[error("snapshot was rejected")]
    RejectSnapshot,

    /// The snapshot format was rejected
    #[error("snapshot format was rejected")]
    RejectFormat,

    /// The peers that advertised the snapshot were rejected
    #[error("snapshot senders were rejected")]
    RejectSender,

    /// Waited too long for the next chunk to be delivered
    #[error("timed out waiting for chunk")]
    ChunkTimeout,

    /// A state provider request exceeded its deadline
    #[error("state provider request timed out")]
    ProviderTimeout,

    /// The restored application failed verification
    #[error("verification failed: {0}")]
    VerifyFailed(String),

    /// The state provider has no witnesses to verify against
    #[error("no witnesses connected")]
    NoWitnesses,

    /// The pool has no suitable snapshots and discovery is disabled
    #[error("no suitable snapshots found")]
    NoSnapshots,

    /// A state sync is already in progress
    #[error("a state sync is already in progress")]
    AlreadyInProgress,

    /// A chunk arrived while no state sync was in progress
    #[error("no state sync in progress")]
    NoSyncInProgress,

    /// A chunk queue operation failed
    #[error(transparent)]
    Queue(#[from] ChunkQueueError),

    /// A malformed snapshot was offered to the pool
    #[error("invalid snapshot: {0}")]
    Pool(#[from] SnapshotPoolError),

    /// Talking to the application engine failed
    #[error("application connection failed: {0}")]
    App(String),

    /// The configuration is unusable
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An unexpected internal failure
    #[error("{0}")]
    Internal(String),
}

/// Send capability towards peers on the two state sync channels.
///
/// Sends are fire-and-forget; responses come back asynchronously through
/// [`Syncer::add_snapshot`] and [`Syncer::add_chunk`].
pub trait SnapshotNetwork: Send + Sync {
    /// Ask a peer to advertise its snapshots (snapshot channel)
    fn request_snapshots(&self, peer: PeerId);

    /// Request a chunk from a peer (chunk channel)
    fn request_chunk(&self, peer: PeerId, request: ChunkRequest);
}

/// Runs a state sync against the local application engine.
///
/// Use [`Syncer::sync_any`] to automatically attempt all snapshots in the
/// pool (pausing to discover new ones), or [`Syncer::sync`] to restore a
/// specific snapshot. Snapshots and chunks are fed in via
/// [`Syncer::add_snapshot`] and [`Syncer::add_chunk`] as they arrive from
/// peers.
pub struct Syncer<A, Q, P, N> {
    config: StateSyncConfig,
    app_conn: Arc<A>,
    query_conn: Arc<Q>,
    provider: Arc<P>,
    network: Arc<N>,
    snapshots: Arc<SnapshotPool>,
    temp_dir: PathBuf,

    /// The queue of the sync in progress, if any. Ingress takes the read
    /// lock; [`Syncer::sync`] claims and releases it under the write lock.
    current: RwLock<Option<Arc<ChunkQueue>>>,
}

impl<A, Q, P, N> Syncer<A, Q, P, N>
where
    A: SnapshotConnection,
    Q: QueryConnection,
    P: StateProvider,
    N: SnapshotNetwork + 'static,
{
    /// Create a new syncer staging chunks under `temp_dir`
    pub fn new(
        config: StateSyncConfig,
        app_conn: Arc<A>,
        query_conn: Arc<Q>,
        provider: Arc<P>,
        network: Arc<N>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            app_conn,
            query_conn,
            provider,
            network,
            snapshots: Arc::new(SnapshotPool::new()),
            temp_dir: temp_dir.into(),
            current: RwLock::new(None),
        }
    }

    /// The pool of snapshots known from peer advertisements
    pub fn snapshot_pool(&self) -> &SnapshotPool {
        self.snapshots.as_ref()
    }

    /// Add a snapshot advertised by a peer.
    ///
    /// Returns `true` if a new, previously unseen snapshot was accepted.
    pub fn add_snapshot(&self, peer: PeerId, snapshot: Snapshot) -> crate::Result<bool> {
        let added = self.snapshots.add(peer, snapshot.clone())?;
        if added {
            info!(
                "discovered new snapshot: height {} format {} hash {}",
                snapshot.height,
                snapshot.format,
                hex::encode(&snapshot.hash)
            );
        }
        Ok(added)
    }

    /// Add a chunk to the queue of the sync in progress.
    ///
    /// Returns `false` if the chunk was already delivered; fails if no sync
    /// is in progress or the chunk does not fit the active snapshot.
    pub fn add_chunk(&self, chunk: Chunk) -> crate::Result<bool> {
        let queue = {
            let current = self.current.read();
            match current.as_ref() {
                Some(queue) => Arc::clone(queue),
                None => return Err(StateSyncError::NoSyncInProgress),
            }
        };
        let added = queue.add(&chunk)?;
        if added {
            debug!(
                "added chunk {} to queue (height {} format {})",
                chunk.index, chunk.height, chunk.format
            );
        } else {
            debug!(
                "ignoring duplicate chunk {} (height {} format {})",
                chunk.index, chunk.height, chunk.format
            );
        }
        Ok(added)
    }

    /// Register a new peer and ask it to advertise its snapshots
    pub fn add_peer(&self, peer: PeerId) {
        debug!("requesting snapshots from peer {}", hex::encode(peer));
        self.network.request_snapshots(peer);
    }

    /// Remove a disconnected peer from the pool
    pub fn remove_peer(&self, peer: PeerId) {
        debug!("removing peer {} from sync", hex::encode(peer));
        self.snapshots.remove_peer(peer);
    }

    /// Try to sync any snapshot in the pool, waiting `discovery_time` for
    /// peers to advertise snapshots if none are found.
    ///
    /// `retry_hook` is invoked before every additional discovery wait, e.g.
    /// to re-broadcast snapshot requests. Returns the verified state and
    /// block commitment the caller must use to bootstrap the node.
    pub async fn sync_any(
        &self,
        discovery_time: Duration,
        mut retry_hook: impl FnMut(),
    ) -> crate::Result<(ReplicatedState, BlockCommit)> {
        let discovery_time = effective_discovery_time(discovery_time);
        if !discovery_time.is_zero() {
            info!("discovering snapshots for {:?}", discovery_time);
            sleep(discovery_time).await;
        }

        // The app may ask us to retry a snapshot restoration, in which case
        // the snapshot and chunk queue carry over to the next iteration.
        let mut snapshot: Option<Snapshot> = None;
        let mut queue: Option<Arc<ChunkQueue>> = None;
        loop {
            if snapshot.is_none() {
                snapshot = self.snapshots.best();
                queue = None;
            }
            let snap = match snapshot.as_ref() {
                Some(snap) => snap.clone(),
                None => {
                    if discovery_time.is_zero() {
                        return Err(StateSyncError::NoSnapshots);
                    }
                    retry_hook();
                    info!("discovering snapshots for {:?}", discovery_time);
                    sleep(discovery_time).await;
                    continue;
                }
            };
            let q = match queue.take() {
                Some(q) => q,
                None => Arc::new(ChunkQueue::new(&snap, &self.temp_dir).map_err(|err| {
                    StateSyncError::Internal(format!("failed to create chunk queue: {}", err))
                })?),
            };
            queue = Some(Arc::clone(&q));

            match self.sync(&snap, Arc::clone(&q)).await {
                Ok(result) => {
                    q.close();
                    return Ok(result);
                }
                Err(StateSyncError::Aborted) => {
                    q.close();
                    return Err(StateSyncError::Aborted);
                }
                Err(StateSyncError::RetrySnapshot) => {
                    q.retry_all();
                    info!(
                        "retrying snapshot: height {} format {} hash {}",
                        snap.height,
                        snap.format,
                        hex::encode(&snap.hash)
                    );
                    continue;
                }
                Err(StateSyncError::ChunkTimeout) => {
                    self.snapshots.reject(&snap);
                    error!(
                        "timed out waiting for snapshot chunks, rejected snapshot: \
                         height {} format {} hash {}",
                        snap.height,
                        snap.format,
                        hex::encode(&snap.hash)
                    );
                }
                Err(StateSyncError::RejectSnapshot) => {
                    self.snapshots.reject(&snap);
                    info!(
                        "snapshot rejected: height {} format {} hash {}",
                        snap.height,
                        snap.format,
                        hex::encode(&snap.hash)
                    );
                }
                Err(StateSyncError::RejectFormat) => {
                    self.snapshots.reject_format(snap.format);
                    info!("snapshot format {} rejected", snap.format);
                }
                Err(StateSyncError::RejectSender) => {
                    info!(
                        "snapshot senders rejected: height {} format {} hash {}",
                        snap.height,
                        snap.format,
                        hex::encode(&snap.hash)
                    );
                    for peer in self.snapshots.get_peers(&snap) {
                        self.snapshots.reject_peer(peer);
                        info!("snapshot sender {} rejected", hex::encode(peer));
                    }
                }
                Err(StateSyncError::ProviderTimeout) => {
                    self.snapshots.reject(&snap);
                    info!(
                        "timed out validating snapshot, rejected: height {}",
                        snap.height
                    );
                }
                Err(err) => {
                    q.close();
                    error!("snapshot restoration failed: {}", err);
                    return Err(err);
                }
            }

            // Discard snapshot and queue for the next candidate
            q.close();
            snapshot = None;
            queue = None;
        }
    }

    /// Restore a specific snapshot, returning the verified state and block
    /// commitment the caller must use to bootstrap the node.
    pub async fn sync(
        &self,
        snapshot: &Snapshot,
        queue: Arc<ChunkQueue>,
    ) -> crate::Result<(ReplicatedState, BlockCommit)> {
        if queue.chunk_count() != snapshot.chunk_count {
            return Err(StateSyncError::Internal(format!(
                "chunk queue has {} slots, snapshot has {} chunks",
                queue.chunk_count(),
                snapshot.chunk_count
            )));
        }

        {
            let mut current = self.current.write();
            if current.is_some() {
                return Err(StateSyncError::AlreadyInProgress);
            }
            *current = Some(Arc::clone(&queue));
        }

        let result = self.restore(snapshot, &queue).await;
        *self.current.write() = None;
        result
    }

    async fn restore(
        &self,
        snapshot: &Snapshot,
        queue: &Arc<ChunkQueue>,
    ) -> crate::Result<(ReplicatedState, BlockCommit)> {
        let mut snapshot = snapshot.clone();

        // Attest the snapshot height before touching the application.
        let app_hash = attested("app hash", self.provider.app_hash(snapshot.height)).await?;
        snapshot.trusted_app_hash = Some(app_hash);

        self.offer_snapshot(&snapshot).await?;

        // Chunk fetchers share one cancellation scope and are joined before
        // this method returns, so a later sync can never race stragglers.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut fetchers = Vec::with_capacity(self.config.chunk_fetchers as usize);
        for _ in 0..self.config.chunk_fetchers {
            fetchers.push(tokio::spawn(fetch_chunks(
                Arc::clone(&self.network),
                Arc::clone(&self.snapshots),
                snapshot.clone(),
                Arc::clone(queue),
                self.config.chunk_request_timeout,
                cancel_rx.clone(),
            )));
        }

        let result = async {
            // Build the bootstrap artifacts while chunks are still in
            // flight, so a trust failure never follows a completed restore.
            let state = attested("state", self.provider.state(snapshot.height)).await?;
            let commit = attested("commit", self.provider.commit(snapshot.height)).await?;

            self.apply_chunks(queue).await?;
            self.verify_app(&snapshot, state.consensus.app).await?;

            Ok((state, commit))
        }
        .await;

        let _ = cancel_tx.send(true);
        for fetcher in fetchers {
            let _ = fetcher.await;
        }

        if result.is_ok() {
            info!(
                "snapshot restored: height {} format {} hash {}",
                snapshot.height,
                snapshot.format,
                hex::encode(&snapshot.hash)
            );
        }
        result
    }

    /// Offer a snapshot to the application engine, classifying its verdict
    async fn offer_snapshot(&self, snapshot: &Snapshot) -> crate::Result<()> {
        info!(
            "offering snapshot to application: height {} format {} hash {}",
            snapshot.height,
            snapshot.format,
            hex::encode(&snapshot.hash)
        );
        let response = self
            .app_conn
            .offer_snapshot(OfferSnapshotRequest {
                snapshot: snapshot.clone(),
                app_hash: snapshot.trusted_app_hash.clone().unwrap_or_default(),
            })
            .await
            .map_err(|err| StateSyncError::App(format!("failed to offer snapshot: {}", err)))?;
        match response {
            OfferSnapshotResponse::Accept => {
                info!(
                    "snapshot accepted, restoring: height {} format {}",
                    snapshot.height, snapshot.format
                );
                Ok(())
            }
            OfferSnapshotResponse::Abort => Err(StateSyncError::Aborted),
            OfferSnapshotResponse::Reject => Err(StateSyncError::RejectSnapshot),
            OfferSnapshotResponse::RejectFormat => Err(StateSyncError::RejectFormat),
            OfferSnapshotResponse::RejectSender => Err(StateSyncError::RejectSender),
        }
    }

    /// Drain the queue in ascending index order, feeding each chunk to the
    /// application and dispatching on its response
    async fn apply_chunks(&self, queue: &ChunkQueue) -> crate::Result<()> {
        loop {
            let chunk = match timeout(CHUNK_TIMEOUT, queue.next_chunk()).await {
                Err(_) => return Err(StateSyncError::ChunkTimeout),
                Ok(result) => match result? {
                    Some(chunk) => chunk,
                    None => return Ok(()),
                },
            };

            let response = self
                .app_conn
                .apply_snapshot_chunk(ApplySnapshotChunkRequest {
                    index: chunk.index,
                    chunk: chunk.data,
                    sender: chunk.sender,
                })
                .await
                .map_err(|err| {
                    StateSyncError::App(format!("failed to apply chunk {}: {}", chunk.index, err))
                })?;
            debug!(
                "applied snapshot chunk {}/{} (height {})",
                chunk.index + 1,
                queue.chunk_count(),
                chunk.height
            );

            // Discard and refetch any chunks as requested by the app
            for index in response.refetch_chunks {
                queue.discard(index)?;
            }

            // Reject any senders as requested by the app
            for sender in response.reject_senders {
                self.snapshots.reject_peer(sender);
                queue.discard_sender(sender);
            }

            match response.result {
                ApplySnapshotChunkResult::Accept => {}
                ApplySnapshotChunkResult::Abort => return Err(StateSyncError::Aborted),
                ApplySnapshotChunkResult::Retry => queue.retry(chunk.index),
                ApplySnapshotChunkResult::RetrySnapshot => {
                    return Err(StateSyncError::RetrySnapshot)
                }
                ApplySnapshotChunkResult::RejectSnapshot => {
                    return Err(StateSyncError::RejectSnapshot)
                }
            }
        }
    }

    /// Verify the restored application against the attested reference
    async fn verify_app(&self, snapshot: &Snapshot, app_version: u64) -> crate::Result<()> {
        let info = self
            .query_conn
            .info()
            .await
            .map_err(|err| StateSyncError::App(format!("failed to query app info: {}", err)))?;

        // The version reported by the application must match the one in the
        // replicated state; a mismatch means the app does not implement
        // state sync or the info call correctly.
        if info.app_version != app_version {
            return Err(StateSyncError::VerifyFailed(format!(
                "app version mismatch, expected {} got {}",
                app_version, info.app_version
            )));
        }
        let trusted = snapshot.trusted_app_hash.clone().unwrap_or_default();
        if info.last_block_app_hash != trusted {
            error!(
                "app hash verification failed, expected {} got {}",
                hex::encode(&trusted),
                hex::encode(&info.last_block_app_hash)
            );
            return Err(StateSyncError::VerifyFailed("app hash mismatch".to_string()));
        }
        if info.last_block_height != snapshot.height {
            error!(
                "application reported unexpected last block height, expected {} got {}",
                snapshot.height, info.last_block_height
            );
            return Err(StateSyncError::VerifyFailed(
                "last block height mismatch".to_string(),
            ));
        }

        info!(
            "verified application at height {} with app hash {}",
            snapshot.height,
            hex::encode(&trusted)
        );
        Ok(())
    }
}

/// Run a state provider request under the standard deadline, classifying
/// the outcome.
async fn attested<T>(
    what: &str,
    request: impl Future<Output = Result<T, ProviderError>>,
) -> crate::Result<T> {
    match timeout(PROVIDER_TIMEOUT, request).await {
        Err(_) => Err(StateSyncError::ProviderTimeout),
        Ok(Err(ProviderError::NoWitnesses)) => Err(StateSyncError::NoWitnesses),
        Ok(Err(err)) => {
            info!("failed to fetch and verify {}: {}", what, err);
            Err(StateSyncError::RejectSnapshot)
        }
        Ok(Ok(value)) => Ok(value),
    }
}

/// One chunk fetcher worker.
///
/// Allocates chunk indices from the queue and requests them from peers
/// advertising the snapshot. If a requested chunk does not arrive within
/// `request_timeout`, the same index is re-requested from a (possibly
/// different) peer; whichever delivery arrives first fills the slot.
/// Workers exit when the queue is closed or the scope is cancelled.
async fn fetch_chunks<N: SnapshotNetwork + 'static>(
    network: Arc<N>,
    pool: Arc<SnapshotPool>,
    snapshot: Snapshot,
    queue: Arc<ChunkQueue>,
    request_timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut next = true;
    let mut index = 0u32;

    loop {
        if next {
            index = match queue.allocate() {
                Some(index) => index,
                None => {
                    // Nothing to fetch right now; restoration may still
                    // reopen slots for refetching, so keep checking until
                    // cancelled.
                    if *cancel.borrow() || queue.is_closed() {
                        return;
                    }
                    tokio::select! {
                        _ = sleep(ALLOCATE_RECHECK_INTERVAL) => {}
                        _ = cancel.changed() => return,
                    }
                    continue;
                }
            };
        }

        debug!(
            "fetching snapshot chunk {}/{} (height {} format {})",
            index + 1,
            queue.chunk_count(),
            snapshot.height,
            snapshot.format
        );
        let peer = match pool.get_peer(&snapshot) {
            Some(peer) => peer,
            None => {
                error!(
                    "no valid peers for snapshot: height {} format {} hash {}",
                    snapshot.height,
                    snapshot.format,
                    hex::encode(&snapshot.hash)
                );
                return;
            }
        };
        network.request_chunk(
            peer,
            ChunkRequest {
                height: snapshot.height,
                format: snapshot.format,
                index,
            },
        );

        tokio::select! {
            _ = queue.wait_for(index) => {
                next = true;
            }
            _ = sleep(request_timeout) => {
                // Give up on this attempt and re-request the same index.
                next = false;
            }
            _ = cancel.changed() => return,
        }
    }
}

/// Round accidentally-short discovery times up to a usable value
fn effective_discovery_time(discovery_time: Duration) -> Duration {
    if !discovery_time.is_zero() && discovery_time < MINIMUM_DISCOVERY_TIME {
        MINIMUM_DISCOVERY_TIME * 5
    } else {
        discovery_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_time_rounding() {
        assert_eq!(effective_discovery_time(Duration::ZERO), Duration::ZERO);
        assert_eq!(
            effective_discovery_time(Duration::from_secs(1)),
            Duration::from_secs(25)
        );
        assert_eq!(
            effective_discovery_time(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_discovery_time(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn config_defaults_are_valid() {
        let config = StateSyncConfig::default();
        assert_eq!(config.chunk_fetchers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_values() {
        let mut config = StateSyncConfig::default();
        config.chunk_fetchers = 0;
        assert!(config.validate().is_err());

        let mut config = StateSyncConfig::default();
        config.chunk_request_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
