//! Generated-style protobuf types for the hive wire format.

/// A batch of signed peer records.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Peers {
    /// The gossiped records, at most `MAX_BATCH_SIZE` per message.
    #[prost(message, repeated, tag = "1")]
    pub peers: ::prost::alloc::vec::Vec<Record>,
}

/// One signed peer record on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    /// 32-byte overlay address.
    #[prost(bytes = "vec", tag = "1")]
    pub overlay: ::prost::alloc::vec::Vec<u8>,
    /// Binary underlay multiaddr.
    #[prost(bytes = "vec", tag = "2")]
    pub underlay: ::prost::alloc::vec::Vec<u8>,
    /// 65-byte recoverable signature over the handshake payload.
    #[prost(bytes = "vec", tag = "3")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}
