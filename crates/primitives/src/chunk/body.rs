use std::sync::OnceLock;

use alloy_primitives::Keccak256;
use bytes::{Bytes, BytesMut};

use crate::{ChunkError, Span, SwarmAddress, CHUNK_SIZE, SPAN_SIZE};

/// The span-prefixed payload shared by both chunk kinds.
///
/// The span is the total number of bytes reachable under the chunk: the
/// payload length for a leaf, the subtree byte count for an interior chunk
/// of the hash tree.
#[derive(Debug, Clone)]
pub struct ChunkBody {
    span: Span,
    data: Bytes,
    cached_hash: OnceLock<SwarmAddress>,
}

// The hash cache must not participate in equality.
impl PartialEq for ChunkBody {
    fn eq(&self, other: &Self) -> bool {
        self.span == other.span && self.data == other.data
    }
}

impl Eq for ChunkBody {}

impl ChunkBody {
    /// Creates a body from a span and payload, validating the payload size.
    ///
    /// When the span fits inside a single chunk it must equal the payload
    /// length; larger spans belong to interior chunks whose payload is a
    /// list of child references.
    pub fn new(span: Span, data: impl Into<Bytes>) -> Result<Self, ChunkError> {
        let data = data.into();
        if data.len() > CHUNK_SIZE {
            return Err(ChunkError::InvalidSpan {
                context: "payload exceeds maximum chunk size",
                size: data.len(),
                limit: CHUNK_SIZE,
            });
        }
        Ok(Self {
            span,
            data,
            cached_hash: OnceLock::new(),
        })
    }

    /// The span of the body.
    pub fn span(&self) -> Span {
        self.span
    }

    /// The raw payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Serialized size: span prefix plus payload.
    pub fn size(&self) -> usize {
        SPAN_SIZE + self.data.len()
    }

    /// The content address of the body: `keccak256(span_le || payload)`.
    pub fn hash(&self) -> SwarmAddress {
        *self.cached_hash.get_or_init(|| {
            let mut hasher = Keccak256::new();
            hasher.update(self.span.to_le_bytes());
            hasher.update(&self.data);
            SwarmAddress::from(hasher.finalize())
        })
    }

    /// Serializes the body into its wire form.
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.size());
        bytes.extend_from_slice(&self.span.to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes.freeze()
    }

    /// Parses a body from its wire form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ChunkError> {
        if buf.len() < SPAN_SIZE {
            return Err(ChunkError::InsufficientData {
                min_size: SPAN_SIZE,
                actual_size: buf.len(),
            });
        }
        // SAFETY: the length is checked above.
        let span = Span::from_le_bytes(buf[..SPAN_SIZE].try_into().unwrap());
        Self::new(span, Bytes::copy_from_slice(&buf[SPAN_SIZE..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_roundtrip() {
        let body = ChunkBody::new(5, vec![1, 2, 3, 4, 5]).unwrap();
        let decoded = ChunkBody::from_bytes(&body.to_bytes()).unwrap();
        assert_eq!(body, decoded);
        assert_eq!(decoded.span(), 5);
        assert_eq!(decoded.size(), SPAN_SIZE + 5);
    }

    #[test]
    fn body_rejects_oversized_payload() {
        let result = ChunkBody::new(42, vec![0u8; CHUNK_SIZE + 1]);
        assert!(matches!(result, Err(ChunkError::InvalidSpan { .. })));
    }

    #[test]
    fn hash_is_stable() {
        let body = ChunkBody::new(3, vec![1, 2, 3]).unwrap();
        assert_eq!(body.hash(), body.hash());
    }

    #[test]
    fn hash_depends_on_span() {
        let a = ChunkBody::new(3, vec![1, 2, 3]).unwrap();
        let b = ChunkBody::new(4, vec![1, 2, 3]).unwrap();
        assert_ne!(a.hash(), b.hash());
    }
}
