//! State Provider
//!
//! The state provider is an external oracle (typically a light client over
//! the consensus network) that independently vouches for the application
//! hash, the replicated-state descriptor, and the block commitment at a
//! given height. The syncer uses it to attest snapshots before offering
//! them to the application engine and to build the artifacts the caller
//! needs to bootstrap the node.
//!
//! Every provider call made by the syncer is bounded by a 30-second
//! deadline; the provider itself only reports whether it could fetch and
//! verify the requested data.

use crate::Hash;
use serde::{Deserialize, Serialize};

/// Errors raised by the state provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// No witnesses are available to verify the requested height.
    ///
    /// This is not recoverable within the current attempt and is surfaced
    /// to the caller unchanged.
    #[error("no witnesses connected")]
    NoWitnesses,

    /// The provider failed to fetch or verify the requested data
    #[error("{0}")]
    Fetch(String),
}

/// Protocol versions carried by the replicated state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusVersion {
    /// Block protocol version
    pub block: u64,

    /// Application protocol version
    pub app: u64,
}

/// Verified replicated-state descriptor at a snapshot height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedState {
    /// Height the state describes
    pub height: u64,

    /// Application hash at this height
    pub app_hash: Vec<u8>,

    /// Consensus protocol versions in force at this height
    pub consensus: ConsensusVersion,
}

/// Verified block commitment used to bootstrap the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCommit {
    /// Height the commitment is for
    pub height: u64,

    /// Hash of the committed block
    pub block_hash: Hash,
}

/// Oracle for independently verified state at a given height
#[async_trait::async_trait]
pub trait StateProvider: Send + Sync {
    /// The attested application hash at `height`
    async fn app_hash(&self, height: u64) -> Result<Vec<u8>, ProviderError>;

    /// The verified replicated-state descriptor at `height`
    async fn state(&self, height: u64) -> Result<ReplicatedState, ProviderError>;

    /// The verified block commitment at `height`
    async fn commit(&self, height: u64) -> Result<BlockCommit, ProviderError>;
}
