//! The chunk data model.
//!
//! A chunk is a content-addressed byte block of at most
//! [`CHUNK_SIZE`](crate::CHUNK_SIZE) payload bytes prefixed with an 8-byte
//! little-endian span. Content-addressed chunks hash their own contents;
//! single-owner chunks derive their address from an identifier and the
//! recovered owner of an embedded signature.

mod body;
pub use body::ChunkBody;
mod content;
pub use content::ContentChunk;
mod single_owner;
pub use single_owner::{soc_address, SingleOwnerChunk};

use bytes::Bytes;
use thiserror::Error;

use crate::{SwarmAddress, CHUNK_SIZE, SPAN_SIZE};

/// Errors produced while constructing or validating chunks.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The span prefix is missing or disagrees with the payload.
    #[error("invalid span: {context} (size {size}, limit {limit})")]
    InvalidSpan {
        context: &'static str,
        size: usize,
        limit: usize,
    },
    /// The recomputed content address does not match.
    #[error("invalid hash: expected {expected}, computed {computed}")]
    InvalidHash {
        expected: SwarmAddress,
        computed: SwarmAddress,
    },
    /// The embedded signature could not be parsed or recovered.
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] alloy_primitives::SignatureError),
    /// Signing failed while creating an owned chunk.
    #[error("signer failure: {0}")]
    Signer(#[from] alloy_signer::Error),
    /// The recovered owner does not reproduce the chunk address.
    #[error("owner mismatch: address {address}, derived {derived}")]
    OwnerMismatch {
        address: SwarmAddress,
        derived: SwarmAddress,
    },
    /// Not enough bytes for the fixed fields of the chunk kind.
    #[error("insufficient data: need at least {min_size} bytes, got {actual_size}")]
    InsufficientData { min_size: usize, actual_size: usize },
}

/// A chunk of either kind, as it travels through stores and protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyChunk {
    /// Content-addressed chunk.
    Content(ContentChunk),
    /// Single-owner chunk.
    SingleOwner(SingleOwnerChunk),
}

impl AnyChunk {
    /// The address of the chunk.
    pub fn address(&self) -> SwarmAddress {
        match self {
            AnyChunk::Content(c) => c.address(),
            AnyChunk::SingleOwner(c) => c.address(),
        }
    }

    /// The full wire form of the chunk (everything after the address).
    pub fn data(&self) -> Bytes {
        match self {
            AnyChunk::Content(c) => c.to_bytes(),
            AnyChunk::SingleOwner(c) => c.to_bytes(),
        }
    }

    /// The span of the chunk body.
    pub fn span(&self) -> crate::Span {
        match self {
            AnyChunk::Content(c) => c.span(),
            AnyChunk::SingleOwner(c) => c.body().span(),
        }
    }

    /// Whether the chunk reproduces `address`.
    pub fn verify(&self, address: &SwarmAddress) -> bool {
        match self {
            AnyChunk::Content(c) => c.verify(address),
            AnyChunk::SingleOwner(c) => c.verify(address),
        }
    }

    /// Parses and validates wire data claiming to live at `address`.
    ///
    /// The data is first interpreted as a content-addressed chunk; when the
    /// recomputed hash disagrees it is re-interpreted as a single-owner
    /// chunk whose recovered owner must reproduce the address.
    pub fn parse_wire(address: &SwarmAddress, data: &[u8]) -> Result<Self, ChunkError> {
        if data.len() < SPAN_SIZE {
            return Err(ChunkError::InsufficientData {
                min_size: SPAN_SIZE,
                actual_size: data.len(),
            });
        }
        if data.len() <= SPAN_SIZE + CHUNK_SIZE {
            if let Ok(content) = ContentChunk::from_bytes(data) {
                if content.verify(address) {
                    return Ok(AnyChunk::Content(content));
                }
            }
        }
        let soc = SingleOwnerChunk::from_bytes(data)?;
        match soc.verify(address) {
            true => Ok(AnyChunk::SingleOwner(soc)),
            false => Err(ChunkError::OwnerMismatch {
                address: *address,
                derived: soc.address(),
            }),
        }
    }
}

impl From<ContentChunk> for AnyChunk {
    fn from(chunk: ContentChunk) -> Self {
        AnyChunk::Content(chunk)
    }
}

impl From<SingleOwnerChunk> for AnyChunk {
    fn from(chunk: SingleOwnerChunk) -> Self {
        AnyChunk::SingleOwner(chunk)
    }
}
