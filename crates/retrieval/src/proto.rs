//! Generated-style protobuf types for the retrieval wire format.

/// A request for the chunk at an address.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// 32-byte chunk address.
    #[prost(bytes = "vec", tag = "1")]
    pub address: ::prost::alloc::vec::Vec<u8>,
}

/// The span-prefixed chunk data answering a request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Delivery {
    /// Span-prefixed chunk data.
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}
