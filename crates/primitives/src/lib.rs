//! Commonly used types in voyager.
//!
//! This crate contains the overlay address algebra, the chunk data model and
//! the signed peer records exchanged during handshakes and gossip.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

/// Size of an overlay or chunk address in bytes.
pub const HASH_SIZE: usize = 32;

/// Size of the little-endian span prefix of a chunk.
pub const SPAN_SIZE: usize = 8;

/// Maximum chunk payload size in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Branching factor of the hash tree.
pub const BRANCHES: usize = 128;

/// Branching factor when each branch also carries a decryption key.
pub const ENCRYPTED_BRANCHES: usize = BRANCHES / 2;

/// Maximum proximity order used for routing.
pub const MAX_PO: u8 = 31;

/// Number of proximity bins, one per PO in `[0, MAX_PO]`.
pub const MAX_BINS: usize = MAX_PO as usize + 1;

/// Uncapped proximity used for prefix balancing. Balancing needs to look
/// `bit_suffix_length + 1` bits past the deepest bin, never further.
pub const EXTENDED_PO: u8 = MAX_PO + 5;

/// Size of a recoverable ECDSA signature in bytes.
pub const SIGNATURE_SIZE: usize = 65;

/// Total byte length reachable under a chunk, little-endian encoded on the wire.
pub type Span = u64;

mod address;
pub use address::{distance, distance_cmp, neighbour_at, SwarmAddress};

pub mod chunk;
pub use chunk::{soc_address, AnyChunk, ChunkError, ContentChunk, SingleOwnerChunk};

mod record;
pub use record::{overlay_address, NodeRecord, RecordError, HANDSHAKE_PREFIX};
