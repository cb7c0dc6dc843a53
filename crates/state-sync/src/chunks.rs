//! Chunk Handling
//!
//! This module provides the chunk-related functionality for state sync:
//! - The chunk structure and the chunk channel protocol messages
//! - The per-snapshot chunk queue with ordered delivery semantics
//!
//! ## Chunk Queue
//!
//! The queue holds one slot per chunk of a single snapshot. Fetchers
//! allocate slot indices to request from peers, inbound chunks fill slots in
//! whatever order they arrive, and the consumer drains the queue strictly in
//! ascending index order via [`ChunkQueue::next_chunk`], which blocks until
//! the next index is present.
//!
//! Payloads are staged in a scoped temp directory rather than held in
//! memory; closing the queue releases all staged data and unblocks every
//! waiter.

use crate::snapshot::Snapshot;
use crate::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::Notify;
use tracing::warn;

/// One piece of a snapshot's binary payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Height of the snapshot this chunk belongs to
    pub height: u64,

    /// Format of the snapshot this chunk belongs to
    pub format: u32,

    /// Zero-based position within the snapshot
    pub index: u32,

    /// Opaque chunk payload
    pub data: Vec<u8>,

    /// Peer that delivered the chunk
    pub sender: PeerId,
}

impl Chunk {
    /// Build a chunk from a wire response and the delivering peer
    pub fn from_response(response: ChunkResponse, sender: PeerId) -> Self {
        Chunk {
            height: response.height,
            format: response.format,
            index: response.index,
            data: response.chunk,
            sender,
        }
    }
}

/// Request for a specific chunk, sent to a peer on the chunk channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    /// Height of the requested snapshot
    pub height: u64,

    /// Format of the requested snapshot
    pub format: u32,

    /// Index of the requested chunk
    pub index: u32,
}

/// Response carrying a chunk, received on the chunk channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResponse {
    /// Height of the snapshot the chunk belongs to
    pub height: u64,

    /// Format of the snapshot the chunk belongs to
    pub format: u32,

    /// Index of the chunk
    pub index: u32,

    /// Chunk payload, empty if missing
    pub chunk: Vec<u8>,

    /// Whether the peer does not have the requested chunk
    pub missing: bool,
}

/// Errors raised by chunk queue operations
#[derive(Debug, thiserror::Error)]
pub enum ChunkQueueError {
    /// The chunk belongs to a different snapshot than the queue
    #[error(
        "chunk is for snapshot {actual_height}/{actual_format}, \
         queue is for {height}/{format}"
    )]
    SnapshotMismatch {
        /// Height the queue was created for
        height: u64,
        /// Format the queue was created for
        format: u32,
        /// Height carried by the chunk
        actual_height: u64,
        /// Format carried by the chunk
        actual_format: u32,
    },

    /// The chunk index does not fit the snapshot
    #[error("chunk index {index} out of range (snapshot has {chunk_count} chunks)")]
    IndexOutOfRange {
        /// Offending index
        index: u32,
        /// Number of chunks in the snapshot
        chunk_count: u32,
    },

    /// Staging a payload to the temp directory failed
    #[error("chunk staging failed: {0}")]
    Io(#[from] std::io::Error),
}

/// State of a single chunk slot
#[derive(Debug, Clone, Copy)]
enum SlotStatus {
    /// No payload and no fetcher working on it
    Empty,

    /// Handed out to a fetcher, payload not yet delivered
    Allocated,

    /// Payload staged on disk
    Present {
        /// Peer that delivered the payload
        sender: PeerId,
    },
}

#[derive(Debug)]
struct QueueState {
    /// Staging directory; `None` once the queue is closed
    dir: Option<TempDir>,
    slots: Vec<SlotStatus>,
    /// Delivery bookkeeping: `next_chunk` returns the lowest undelivered
    /// index, so resetting an entry re-delivers that chunk
    returned: Vec<bool>,
}

impl QueueState {
    /// Lowest index not yet delivered by `next_chunk`
    fn next_pending(&self) -> Option<u32> {
        self.returned.iter().position(|returned| !returned).map(|i| i as u32)
    }

    /// Drop the slot's payload (if any) and make it fetchable and
    /// deliverable again
    fn reset_slot(&mut self, index: u32) {
        if let Some(dir) = self.dir.as_ref() {
            if matches!(self.slots[index as usize], SlotStatus::Present { .. }) {
                let _ = fs::remove_file(chunk_path(dir.path(), index));
            }
        }
        self.slots[index as usize] = SlotStatus::Empty;
        self.returned[index as usize] = false;
    }
}

/// A per-snapshot reassembly buffer with ordered delivery.
///
/// Producers ([`ChunkQueue::add`]) may fill slots in any order;
/// [`ChunkQueue::next_chunk`] never reorders. All operations are
/// individually thread safe.
#[derive(Debug)]
pub struct ChunkQueue {
    height: u64,
    format: u32,
    chunk_count: u32,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ChunkQueue {
    /// Create a queue for `snapshot`, staging payloads in a fresh temp
    /// directory under `temp_dir`
    pub fn new(snapshot: &Snapshot, temp_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(temp_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("state-sync-chunks-")
            .tempdir_in(temp_dir)?;
        Ok(ChunkQueue {
            height: snapshot.height,
            format: snapshot.format,
            chunk_count: snapshot.chunk_count,
            state: Mutex::new(QueueState {
                dir: Some(dir),
                slots: vec![SlotStatus::Empty; snapshot.chunk_count as usize],
                returned: vec![false; snapshot.chunk_count as usize],
            }),
            notify: Notify::new(),
        })
    }

    /// Number of chunks in the snapshot this queue reassembles
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().dir.is_none()
    }

    /// Add a chunk to the queue.
    ///
    /// Returns `false` if the slot already holds a payload (duplicate
    /// delivery) or the queue is closed. Fails if the chunk does not match
    /// the queue's snapshot or its index is out of range.
    pub fn add(&self, chunk: &Chunk) -> Result<bool, ChunkQueueError> {
        if chunk.height != self.height || chunk.format != self.format {
            return Err(ChunkQueueError::SnapshotMismatch {
                height: self.height,
                format: self.format,
                actual_height: chunk.height,
                actual_format: chunk.format,
            });
        }
        if chunk.index >= self.chunk_count {
            return Err(ChunkQueueError::IndexOutOfRange {
                index: chunk.index,
                chunk_count: self.chunk_count,
            });
        }

        {
            let mut state = self.state.lock();
            let dir = match state.dir.as_ref() {
                Some(dir) => dir.path().to_path_buf(),
                None => return Ok(false),
            };
            match state.slots[chunk.index as usize] {
                SlotStatus::Present { .. } => return Ok(false),
                SlotStatus::Empty | SlotStatus::Allocated => {
                    fs::write(chunk_path(&dir, chunk.index), &chunk.data)?;
                    state.slots[chunk.index as usize] = SlotStatus::Present {
                        sender: chunk.sender,
                    };
                }
            }
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    /// Hand out the lowest empty slot for fetching.
    ///
    /// Returns `None` when every slot is already allocated or filled (or the
    /// queue is closed); a slot reopened by a retry or discard becomes
    /// allocatable again.
    pub fn allocate(&self) -> Option<u32> {
        let mut state = self.state.lock();
        if state.dir.is_none() {
            return None;
        }
        let index = state
            .slots
            .iter()
            .position(|slot| matches!(slot, SlotStatus::Empty))?;
        state.slots[index] = SlotStatus::Allocated;
        Some(index as u32)
    }

    /// Deliver the next chunk in ascending index order, blocking until it is
    /// present.
    ///
    /// Returns `None` once all chunks have been delivered, or when the queue
    /// is closed.
    pub async fn next_chunk(&self) -> Result<Option<Chunk>, ChunkQueueError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                let dir = match state.dir.as_ref() {
                    Some(dir) => dir.path().to_path_buf(),
                    None => return Ok(None),
                };
                let index = match state.next_pending() {
                    Some(index) => index,
                    None => return Ok(None),
                };
                if let SlotStatus::Present { sender } = state.slots[index as usize] {
                    let data = fs::read(chunk_path(&dir, index))?;
                    state.returned[index as usize] = true;
                    return Ok(Some(Chunk {
                        height: self.height,
                        format: self.format,
                        index,
                        data,
                        sender,
                    }));
                }
            }
            notified.await;
        }
    }

    /// Wait until the slot holds a payload.
    ///
    /// Completes immediately if the payload is already there; also completes
    /// when the queue is closed, so waiters never hang on a dead queue.
    pub async fn wait_for(&self, index: u32) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if state.dir.is_none() {
                    return;
                }
                if matches!(
                    state.slots.get(index as usize),
                    Some(SlotStatus::Present { .. })
                ) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Reset a slot back to empty so the chunk is refetched and redelivered
    pub fn retry(&self, index: u32) {
        if index >= self.chunk_count {
            return;
        }
        self.state.lock().reset_slot(index);
    }

    /// Reset the allocation of every slot without a payload and rewind
    /// delivery to the first chunk.
    ///
    /// Payloads that already arrived are preserved and will be redelivered.
    pub fn retry_all(&self) {
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if matches!(slot, SlotStatus::Allocated) {
                *slot = SlotStatus::Empty;
            }
        }
        for returned in state.returned.iter_mut() {
            *returned = false;
        }
    }

    /// Discard a chunk's payload, forcing it to be refetched and reapplied
    pub fn discard(&self, index: u32) -> Result<(), ChunkQueueError> {
        if index >= self.chunk_count {
            return Err(ChunkQueueError::IndexOutOfRange {
                index,
                chunk_count: self.chunk_count,
            });
        }
        self.state.lock().reset_slot(index);
        Ok(())
    }

    /// Discard all undelivered chunks received from `peer`
    pub fn discard_sender(&self, peer: PeerId) {
        let mut state = self.state.lock();
        for index in 0..self.chunk_count {
            if state.returned[index as usize] {
                continue;
            }
            if matches!(
                state.slots[index as usize],
                SlotStatus::Present { sender } if sender == peer
            ) {
                state.reset_slot(index);
            }
        }
    }

    /// Close the queue, releasing all staged payloads and unblocking every
    /// waiter. Closing an already-closed queue is a no-op.
    pub fn close(&self) {
        let dir = self.state.lock().dir.take();
        if let Some(dir) = dir {
            if let Err(err) = dir.close() {
                warn!("failed to clean up chunk staging directory: {}", err);
            }
        }
        self.notify.notify_waiters();
    }
}

/// Staging path for a chunk payload
fn chunk_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("chunk-{:06}", index))
}
