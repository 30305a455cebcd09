//! The local chunk store.
//!
//! Chunk reads and writes are parameterized by access modes that control
//! index side effects: whether a put schedules push propagation, whether a
//! get refreshes the eviction order, whether a chunk is pinned out of the
//! garbage collector's reach. The eviction order is strictly
//! oldest-access-first among eligible chunks.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod mode;
pub use mode::{ModeGet, ModePut, ModeSet};
mod store;
pub use store::{LocalStore, LocalStoreConfig, PinnedChunk};

use async_trait::async_trait;
use thiserror::Error;
use voyager_primitives::{AnyChunk, ChunkError, SwarmAddress};

/// Errors surfaced by chunk stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The chunk is not present locally.
    #[error("storage: not found")]
    NotFound,
    /// The chunk failed validation.
    #[error("invalid chunk: {0}")]
    InvalidChunk(#[from] ChunkError),
    /// Retrieval failed but a recovery attempt was scheduled.
    #[error("failed to retrieve chunk, recovery initiated")]
    RecoveryAttempt,
    /// The chunk could not be fetched from the network either.
    #[error("chunk not found in the network")]
    ChunkNotFound,
    /// Underlying store failure.
    #[error("store: {0}")]
    Store(String),
}

/// The chunk store contract shared by the local store and the netstore.
#[async_trait]
pub trait Storer: Send + Sync + 'static {
    /// Returns the chunk at `address`, applying the mode's index effects.
    async fn get(&self, mode: ModeGet, address: &SwarmAddress)
        -> Result<AnyChunk, StorageError>;

    /// Stores the chunks, returning a per-input `seen` marker that is true
    /// when the chunk already existed.
    async fn put(&self, mode: ModePut, chunks: &[AnyChunk]) -> Result<Vec<bool>, StorageError>;

    /// Whether the chunk exists locally.
    async fn has(&self, address: &SwarmAddress) -> Result<bool, StorageError>;

    /// Updates index state for the given addresses.
    async fn set(&self, mode: ModeSet, addresses: &[SwarmAddress]) -> Result<(), StorageError>;
}
