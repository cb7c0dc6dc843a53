//! # Kestrel State Sync
//!
//! This crate implements the receiving side of state synchronization for
//! Kestrel nodes: instead of replaying the replicated log from genesis, a
//! fresh node downloads a recent snapshot of application state from its
//! peers, feeds it to the local application engine chunk by chunk, and
//! cryptographically verifies the restored state against an independently
//! attested reference before bootstrapping.
//!
//! ## Key Components
//!
//! - **[`Syncer`]**: Orchestrates the restore flow. Use [`Syncer::sync_any`]
//!   to try snapshots from the pool until one succeeds (pausing to discover
//!   new ones), or [`Syncer::sync`] to restore a specific snapshot.
//!   Snapshots and chunks arriving from peers are fed in through
//!   [`Syncer::add_snapshot`] and [`Syncer::add_chunk`].
//!
//! - **[`SnapshotPool`]**: The set of snapshots advertised by peers, with
//!   per-peer attribution and permanent rejection bookkeeping for snapshots,
//!   formats, and senders.
//!
//! - **[`ChunkQueue`]**: A per-snapshot reassembly buffer. Chunks arrive in
//!   any order from concurrent fetchers and are delivered strictly in
//!   ascending index order, with payloads staged in a scoped temp directory.
//!
//! ## Protocol Flow
//!
//! 1. **Discovery**: Peers advertise snapshots; the pool deduplicates them
//!    and tracks who can serve each one.
//!
//! 2. **Selection**: The pool's best candidate (highest height) is attested
//!    with the state provider, then offered to the application engine.
//!
//! 3. **Download**: Chunk fetchers request chunk indices from advertising
//!    peers in parallel, re-requesting from other peers on timeout.
//!
//! 4. **Application**: Chunks are applied to the engine in order; the
//!    engine's response to each chunk drives retry, refetch, and rejection
//!    decisions.
//!
//! 5. **Verification**: The restored application is cross-checked against
//!    the attested app hash, height, and app version.
//!
//! The peer transport, the application engine, and the state provider are
//! reached through the [`SnapshotNetwork`], [`SnapshotConnection`] /
//! [`QueryConnection`], and [`StateProvider`] traits respectively.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod app;
pub mod chunks;
pub mod provider;
pub mod snapshot;
pub mod sync;

// Re-export main types at crate root
pub use app::{
    AppInfo, ApplySnapshotChunkRequest, ApplySnapshotChunkResponse, ApplySnapshotChunkResult,
    OfferSnapshotRequest, OfferSnapshotResponse, QueryConnection, SnapshotConnection,
};
pub use chunks::{Chunk, ChunkQueue, ChunkQueueError, ChunkRequest, ChunkResponse};
pub use provider::{BlockCommit, ConsensusVersion, ProviderError, ReplicatedState, StateProvider};
pub use snapshot::{
    Snapshot, SnapshotKey, SnapshotPool, SnapshotPoolError, SnapshotsRequest, SnapshotsResponse,
};
pub use sync::{SnapshotNetwork, StateSyncConfig, StateSyncError, Syncer};

use sha3::{Digest, Keccak256};

/// A 32-byte hash type used throughout the state sync layer
pub type Hash = [u8; 32];

/// Peer identifier type
pub type PeerId = [u8; 32];

/// Result type for state sync operations
pub type Result<T> = std::result::Result<T, StateSyncError>;

/// Default number of concurrent chunk fetchers
pub const DEFAULT_CHUNK_FETCHERS: u32 = 4;

/// Default timeout before a chunk request is retried against another peer
pub const DEFAULT_CHUNK_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Lowest allowed chunk request timeout
pub const MIN_CHUNK_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Compute Keccak256 hash of multiple data slices
#[inline]
pub fn keccak256_concat(data: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for d in data {
        hasher.update(d);
    }
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}
