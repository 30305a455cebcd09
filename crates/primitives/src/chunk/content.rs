use bytes::Bytes;

use super::ChunkBody;
use crate::{ChunkError, Span, SwarmAddress};

/// A content-addressed chunk: its address is the hash of its own contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChunk {
    body: ChunkBody,
}

impl ContentChunk {
    /// Creates a chunk whose span is the payload length.
    pub fn new(data: impl Into<Bytes>) -> Result<Self, ChunkError> {
        let data = data.into();
        Ok(Self {
            body: ChunkBody::new(data.len() as Span, data)?,
        })
    }

    /// Creates a chunk with an explicit span, as the hash-tree builder does
    /// for interior chunks.
    pub fn new_with_span(span: Span, data: impl Into<Bytes>) -> Result<Self, ChunkError> {
        Ok(Self {
            body: ChunkBody::new(span, data)?,
        })
    }

    /// The content address of the chunk.
    pub fn address(&self) -> SwarmAddress {
        self.body.hash()
    }

    /// Whether the chunk hashes to `address`.
    pub fn verify(&self, address: &SwarmAddress) -> bool {
        *address == self.address()
    }

    /// The payload without the span prefix.
    pub fn payload(&self) -> &Bytes {
        self.body.data()
    }

    /// The span of the chunk.
    pub fn span(&self) -> Span {
        self.body.span()
    }

    /// The span-prefixed wire form.
    pub fn to_bytes(&self) -> Bytes {
        self.body.to_bytes()
    }

    /// Parses the span-prefixed wire form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ChunkError> {
        Ok(Self {
            body: ChunkBody::from_bytes(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CHUNK_SIZE, SPAN_SIZE};

    #[test]
    fn new_sets_span_from_payload() {
        let chunk = ContentChunk::new(vec![1u8, 2, 3]).unwrap();
        assert_eq!(chunk.span(), 3);
        assert_eq!(chunk.payload().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let chunk = ContentChunk::new(vec![1u8; 64]).unwrap();
        let address = chunk.address();
        let mut wire = chunk.to_bytes().to_vec();
        wire[SPAN_SIZE] ^= 0x01;
        let tampered = ContentChunk::from_bytes(&wire).unwrap();
        assert!(!tampered.verify(&address));
    }

    #[test]
    fn roundtrip_max_size() {
        let chunk = ContentChunk::new(vec![0xabu8; CHUNK_SIZE]).unwrap();
        let decoded = ContentChunk::from_bytes(&chunk.to_bytes()).unwrap();
        assert_eq!(chunk, decoded);
        assert_eq!(chunk.address(), decoded.address());
    }
}
