//! Snapshot Protocol
//!
//! This module defines the snapshot descriptor, the protocol messages of the
//! snapshot channel, and the snapshot pool that tracks which peers can serve
//! which snapshots.
//!
//! ## Snapshot Identity
//!
//! Snapshots are deduplicated by `(height, format, hash)`. The pool keys its
//! bookkeeping on a Keccak256 digest of that triple, so two peers
//! advertising the same snapshot collapse into one entry with both peers
//! attributed as senders.
//!
//! ## Rejection Bookkeeping
//!
//! The pool keeps three blacklists: rejected snapshots, rejected formats,
//! and rejected peers. Rejections are permanent for the lifetime of the
//! pool; once a format is rejected, no snapshot in that format is ever
//! offered again, including ones discovered later.

use crate::{keccak256_concat, Hash, PeerId};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Unique identifier for a snapshot, derived from `(height, format, hash)`
pub type SnapshotKey = Hash;

/// Metadata describing a state snapshot advertised by a peer.
///
/// A snapshot is a content-hashed binary representation of application state
/// at a specific height, decomposed into `chunk_count` sequentially indexed
/// chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Block height at which the snapshot was taken
    pub height: u64,

    /// Application-defined format identifier
    pub format: u32,

    /// Total number of chunks in this snapshot
    pub chunk_count: u32,

    /// Fingerprint committing to the snapshot content as advertised
    pub hash: Vec<u8>,

    /// Opaque application metadata
    pub metadata: Vec<u8>,

    /// Application hash vouched for by the state provider.
    ///
    /// Bound during restoration, after attestation succeeds; never sent on
    /// the wire.
    #[serde(skip)]
    pub trusted_app_hash: Option<Vec<u8>>,
}

impl Snapshot {
    /// Compute the identity key used for deduplication and rejection
    /// bookkeeping
    pub fn key(&self) -> SnapshotKey {
        keccak256_concat(&[
            &self.height.to_le_bytes(),
            &self.format.to_le_bytes(),
            &self.hash,
        ])
    }

    /// Check that the snapshot descriptor is well formed
    pub fn validate(&self) -> Result<(), SnapshotPoolError> {
        if self.chunk_count == 0 {
            return Err(SnapshotPoolError::NoChunks);
        }
        if self.hash.is_empty() {
            return Err(SnapshotPoolError::EmptyHash);
        }
        Ok(())
    }
}

/// Errors raised when adding a malformed snapshot to the pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotPoolError {
    /// The snapshot advertises zero chunks
    #[error("snapshot has no chunks")]
    NoChunks,

    /// The snapshot hash is empty
    #[error("snapshot has an empty hash")]
    EmptyHash,
}

/// Request for available snapshots, sent to a peer on the snapshot channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotsRequest {}

/// A single advertised snapshot, received on the snapshot channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotsResponse {
    /// Block height of the advertised snapshot
    pub height: u64,

    /// Application-defined format identifier
    pub format: u32,

    /// Total number of chunks
    pub chunk_count: u32,

    /// Fingerprint of the snapshot content
    pub hash: Vec<u8>,

    /// Opaque application metadata
    pub metadata: Vec<u8>,
}

impl From<SnapshotsResponse> for Snapshot {
    fn from(response: SnapshotsResponse) -> Self {
        Snapshot {
            height: response.height,
            format: response.format,
            chunk_count: response.chunk_count,
            hash: response.hash,
            metadata: response.metadata,
            trusted_app_hash: None,
        }
    }
}

/// The set of snapshots known from peer advertisements.
///
/// The pool attributes every snapshot to the peers that advertised it and
/// maintains permanent blacklists of rejected snapshots, formats, and
/// peers. A snapshot stays in the pool only while at least one non-rejected
/// peer can serve it.
///
/// All operations are individually thread safe.
#[derive(Debug, Default)]
pub struct SnapshotPool {
    inner: RwLock<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    snapshots: HashMap<SnapshotKey, Snapshot>,
    snapshot_peers: HashMap<SnapshotKey, BTreeSet<PeerId>>,
    rejected_snapshots: HashSet<SnapshotKey>,
    rejected_formats: HashSet<u32>,
    rejected_peers: HashSet<PeerId>,
}

impl PoolInner {
    /// Drop the peer from every attribution set, removing snapshots that no
    /// longer have any sender.
    fn detach_peer(&mut self, peer: PeerId) {
        let mut orphaned = Vec::new();
        for (key, peers) in self.snapshot_peers.iter_mut() {
            peers.remove(&peer);
            if peers.is_empty() {
                orphaned.push(*key);
            }
        }
        for key in orphaned {
            self.snapshot_peers.remove(&key);
            self.snapshots.remove(&key);
        }
    }
}

impl SnapshotPool {
    /// Create a new empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a snapshot advertised by `peer`.
    ///
    /// Returns `true` if the snapshot was previously unseen. Snapshots,
    /// formats, and peers that have been rejected are silently ignored.
    /// Fails only if the snapshot descriptor is malformed.
    pub fn add(&self, peer: PeerId, snapshot: Snapshot) -> Result<bool, SnapshotPoolError> {
        snapshot.validate()?;
        let key = snapshot.key();

        let mut inner = self.inner.write();
        if inner.rejected_snapshots.contains(&key)
            || inner.rejected_formats.contains(&snapshot.format)
            || inner.rejected_peers.contains(&peer)
        {
            return Ok(false);
        }

        inner.snapshot_peers.entry(key).or_default().insert(peer);
        if inner.snapshots.contains_key(&key) {
            return Ok(false);
        }
        inner.snapshots.insert(key, snapshot);
        Ok(true)
    }

    /// Return the best candidate snapshot, if any.
    ///
    /// Candidates are ordered by descending `(height, format)` with ties
    /// broken by hash, so repeated calls are deterministic.
    pub fn best(&self) -> Option<Snapshot> {
        let inner = self.inner.read();
        inner
            .snapshots
            .values()
            .max_by(|a, b| (a.height, a.format, &a.hash).cmp(&(b.height, b.format, &b.hash)))
            .cloned()
    }

    /// Return a random non-rejected peer that advertised the snapshot
    pub fn get_peer(&self, snapshot: &Snapshot) -> Option<PeerId> {
        let peers = self.get_peers(snapshot);
        peers.choose(&mut rand::thread_rng()).copied()
    }

    /// Return all non-rejected peers that advertised the snapshot
    pub fn get_peers(&self, snapshot: &Snapshot) -> Vec<PeerId> {
        let inner = self.inner.read();
        match inner.snapshot_peers.get(&snapshot.key()) {
            Some(peers) => peers
                .iter()
                .filter(|peer| !inner.rejected_peers.contains(*peer))
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Reject a snapshot. It will never be returned by [`SnapshotPool::best`]
    /// again.
    pub fn reject(&self, snapshot: &Snapshot) {
        let key = snapshot.key();
        let mut inner = self.inner.write();
        inner.rejected_snapshots.insert(key);
        inner.snapshots.remove(&key);
        inner.snapshot_peers.remove(&key);
    }

    /// Reject a snapshot format. Present and future snapshots in this format
    /// are excluded from the pool.
    pub fn reject_format(&self, format: u32) {
        let mut inner = self.inner.write();
        inner.rejected_formats.insert(format);
        let rejected: Vec<SnapshotKey> = inner
            .snapshots
            .iter()
            .filter(|(_, snapshot)| snapshot.format == format)
            .map(|(key, _)| *key)
            .collect();
        for key in rejected {
            inner.snapshots.remove(&key);
            inner.snapshot_peers.remove(&key);
        }
    }

    /// Reject a peer. Its attributions are removed and snapshots left with
    /// no sender are dropped from the pool.
    pub fn reject_peer(&self, peer: PeerId) {
        let mut inner = self.inner.write();
        inner.rejected_peers.insert(peer);
        inner.detach_peer(peer);
    }

    /// Remove a peer without blacklisting it, e.g. on disconnect
    pub fn remove_peer(&self, peer: PeerId) {
        let mut inner = self.inner.write();
        inner.detach_peer(peer);
    }
}
