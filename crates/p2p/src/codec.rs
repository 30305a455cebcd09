use std::marker::PhantomData;

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Length-prefix size of a framed message.
const LENGTH_PREFIX: usize = 4;

/// Errors produced while framing protocol messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Stream-level I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The payload is not a valid message.
    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The frame exceeds the protocol's message budget.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
}

/// Frames protobuf messages with a 4-byte big-endian length prefix.
///
/// Every protocol in the tree speaks this framing on both ends of a stream;
/// the per-protocol message budget bounds a malicious peer's allocation.
#[derive(Debug)]
pub struct ProstCodec<M> {
    max_message_size: usize,
    _marker: PhantomData<M>,
}

impl<M> ProstCodec<M> {
    /// Creates a codec with the given message budget.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            _marker: PhantomData,
        }
    }
}

impl<M: prost::Message> Encoder for ProstCodec<M> {
    type Item<'a> = M;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.encoded_len();
        if len > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: len,
                limit: self.max_message_size,
            });
        }
        dst.reserve(LENGTH_PREFIX + len);
        dst.put_u32(len as u32);
        item.encode(dst).expect("reserved capacity above");
        Ok(())
    }
}

impl<M: prost::Message + Default> Decoder for ProstCodec<M> {
    type Item = M;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: len,
                limit: self.max_message_size,
            });
        }
        if src.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let frame = src.split_to(len);
        Ok(Some(M::decode(frame.freeze())?))
    }
}
