//! Files as hash trees of chunks.
//!
//! The splitter turns a byte stream into a balanced tree of
//! content-addressed chunks and returns the root reference; the joiner
//! walks the tree back into bytes, lazily and seekably. With encryption
//! enabled every chunk is AES-CTR encrypted under its own random key and
//! references grow to carry the key, halving the branching factor.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod reference;
pub use reference::Reference;
mod splitter;
pub use splitter::Splitter;
mod joiner;
pub use joiner::{join_all, lookahead_buffer_size, JoinReader, Joiner};
mod crypto;

use thiserror::Error;
use voyager_localstore::StorageError;
use voyager_primitives::ChunkError;

/// Size of an unencrypted chunk reference.
pub const REFERENCE_SIZE: usize = 32;
/// Size of a reference carrying a decryption key.
pub const ENCRYPTED_REFERENCE_SIZE: usize = 64;
/// Size of a chunk encryption key.
pub const KEY_SIZE: usize = 32;

/// Errors surfaced by the splitter and joiner.
#[derive(Debug, Error)]
pub enum FileError {
    /// Chunk store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Chunk construction or validation failure.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// The input stream ended short of the promised length.
    #[error("unexpected end of input: expected {expected} bytes, got {got}")]
    UnexpectedEof { expected: u64, got: u64 },
    /// Reading the input stream failed.
    #[error("input: {0}")]
    Io(#[from] std::io::Error),
    /// A reference blob has the wrong size.
    #[error("invalid reference length {0}")]
    InvalidReference(usize),
    /// An interior chunk holds a payload that is not a whole number of
    /// references.
    #[error("malformed branch chunk")]
    MalformedBranch,
    /// A read past the end of the content.
    #[error("offset {offset} out of bounds for span {span}")]
    OutOfBounds { offset: u64, span: u64 },
}
