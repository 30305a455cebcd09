//! Generated-style protobuf types for the pushsync wire format.

/// A chunk offered for storage.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Delivery {
    /// 32-byte chunk address.
    #[prost(bytes = "vec", tag = "1")]
    pub address: ::prost::alloc::vec::Vec<u8>,
    /// Span-prefixed chunk data.
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// A signed acknowledgment of custody.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Receipt {
    /// 32-byte chunk address.
    #[prost(bytes = "vec", tag = "1")]
    pub address: ::prost::alloc::vec::Vec<u8>,
    /// 65-byte recoverable signature over the receipt digest.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: ::prost::alloc::vec::Vec<u8>,
}
