//! Application Engine Connection
//!
//! Typed request/response shapes for the three exchanges the syncer drives
//! against the local application engine, plus the connection traits the
//! engine transport must implement. The underlying transport (socket,
//! in-process channel, ...) is out of scope; implementations return a plain
//! `String` error for transport failures.

use crate::snapshot::Snapshot;
use crate::PeerId;

/// Offer of a snapshot to the application engine
#[derive(Debug, Clone)]
pub struct OfferSnapshotRequest {
    /// Snapshot being offered
    pub snapshot: Snapshot,

    /// The trusted application hash attested for the snapshot height
    pub app_hash: Vec<u8>,
}

/// The engine's verdict on an offered snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferSnapshotResponse {
    /// Start restoring this snapshot
    Accept,

    /// Abort state sync entirely
    Abort,

    /// Reject this snapshot, try another
    Reject,

    /// Reject all snapshots in this format
    RejectFormat,

    /// Reject all peers that advertised this snapshot
    RejectSender,
}

/// A single chunk submitted to the application engine
#[derive(Debug, Clone)]
pub struct ApplySnapshotChunkRequest {
    /// Index of the chunk within the snapshot
    pub index: u32,

    /// Chunk payload
    pub chunk: Vec<u8>,

    /// Peer the chunk was received from
    pub sender: PeerId,
}

/// The engine's verdict on an applied chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplySnapshotChunkResult {
    /// Chunk applied, continue with the next one
    Accept,

    /// Abort state sync entirely
    Abort,

    /// Refetch and resubmit this chunk
    Retry,

    /// Restart restoration of this snapshot from the first chunk
    RetrySnapshot,

    /// Reject this snapshot, try another
    RejectSnapshot,
}

/// Full response to a chunk application
#[derive(Debug, Clone)]
pub struct ApplySnapshotChunkResponse {
    /// The verdict on the applied chunk
    pub result: ApplySnapshotChunkResult,

    /// Chunk indices the engine wants refetched and resubmitted
    pub refetch_chunks: Vec<u32>,

    /// Peers whose chunks the engine considers bad
    pub reject_senders: Vec<PeerId>,
}

impl From<ApplySnapshotChunkResult> for ApplySnapshotChunkResponse {
    fn from(result: ApplySnapshotChunkResult) -> Self {
        ApplySnapshotChunkResponse {
            result,
            refetch_chunks: Vec::new(),
            reject_senders: Vec::new(),
        }
    }
}

/// State reported by the application engine after restoration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    /// Application version as reported by the engine
    pub app_version: u64,

    /// Application hash after the last block
    pub last_block_app_hash: Vec<u8>,

    /// Height of the last block known to the engine
    pub last_block_height: u64,
}

/// Connection used to offer snapshots and feed chunks to the engine
#[async_trait::async_trait]
pub trait SnapshotConnection: Send + Sync {
    /// Offer a snapshot for restoration
    async fn offer_snapshot(
        &self,
        request: OfferSnapshotRequest,
    ) -> Result<OfferSnapshotResponse, String>;

    /// Submit one chunk of the snapshot being restored
    async fn apply_snapshot_chunk(
        &self,
        request: ApplySnapshotChunkRequest,
    ) -> Result<ApplySnapshotChunkResponse, String>;
}

/// Connection used to query the engine's post-restore state
#[async_trait::async_trait]
pub trait QueryConnection: Send + Sync {
    /// Fetch the engine's version and last-block information
    async fn info(&self) -> Result<AppInfo, String>;
}
