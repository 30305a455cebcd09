//! The transport collaborator contract.
//!
//! The node core never touches sockets: it speaks to the transport through
//! [`Streamer`] (open a framed stream to a peer) and [`P2pService`] (dial
//! and hang up). Protocols register [`ProtocolSpec`]s whose handlers the
//! transport invokes with an authenticated [`Peer`] and a raw stream.
//!
//! The in-memory [`mock`] transport wires handlers to streamers directly
//! and backs every protocol test in the workspace.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod codec;
pub use codec::{CodecError, ProstCodec};
pub mod mock;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::{future::BoxFuture, AsyncRead, AsyncWrite};
use libp2p::Multiaddr;
use thiserror::Error;
use tokio::time::Instant;
use voyager_primitives::SwarmAddress;

/// Anything that can carry a protocol stream.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug> RawStream for T {}

/// An open bidirectional stream. Dropping the stream resets it; a graceful
/// close goes through [`futures::AsyncWriteExt::close`].
pub type BoxStream = Box<dyn RawStream>;

/// Fully qualified stream identity within a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolId {
    /// Protocol name, e.g. `pushsync`.
    pub name: &'static str,
    /// Protocol version, e.g. `1.0.0`.
    pub version: &'static str,
    /// Stream name within the protocol, e.g. `pushsync`.
    pub stream: &'static str,
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.name, self.version, self.stream)
    }
}

/// An authenticated remote peer, as the transport reports it to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// The peer's overlay address.
    pub address: SwarmAddress,
}

/// Outcome of a protocol handler.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// An inbound stream handler.
pub type Handler = Arc<dyn Fn(Peer, BoxStream) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A named stream and its handler.
#[derive(Clone)]
pub struct StreamSpec {
    /// Stream name within the protocol.
    pub name: &'static str,
    /// Handler invoked for each inbound stream.
    pub handler: Handler,
}

impl fmt::Debug for StreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSpec").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A protocol and the streams it serves.
#[derive(Debug, Clone)]
pub struct ProtocolSpec {
    /// Protocol name.
    pub name: &'static str,
    /// Protocol version.
    pub version: &'static str,
    /// Served streams.
    pub streams: Vec<StreamSpec>,
}

/// Errors surfaced by the transport.
#[derive(Debug, Error)]
pub enum P2pError {
    /// No live connection to the peer.
    #[error("peer not found: {0}")]
    PeerNotFound(SwarmAddress),
    /// The peer does not serve the protocol.
    #[error("peer does not support protocol {0}")]
    ProtocolNotSupported(ProtocolId),
    /// Stream-level I/O failure.
    #[error("stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by dialing.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// A connection to this underlay already exists; carries the overlay
    /// the transport knows it by.
    #[error("already connected: {0}")]
    AlreadyConnected(SwarmAddress),
    /// The transport asks not to redial before the given instant.
    #[error("connection attempt rejected, retry later")]
    Backoff {
        /// Earliest instant a redial may be attempted.
        try_after: Instant,
    },
    /// The dial timed out.
    #[error("connect timed out")]
    Timeout,
    /// Any other transport failure.
    #[error("transport: {0}")]
    Transport(String),
}

/// Opens streams to connected peers.
#[async_trait]
pub trait Streamer: Send + Sync + 'static {
    /// Opens a fresh stream to `peer` for `protocol`.
    async fn new_stream(
        &self,
        peer: &SwarmAddress,
        protocol: ProtocolId,
    ) -> Result<BoxStream, P2pError>;
}

/// Dial-level control of the transport.
#[async_trait]
pub trait P2pService: Send + Sync + 'static {
    /// Dials `underlay`, returning the overlay of the authenticated peer.
    async fn connect(&self, underlay: &Multiaddr) -> Result<SwarmAddress, ConnectError>;

    /// Drops the connection to `overlay`, if any.
    async fn disconnect(&self, overlay: &SwarmAddress) -> Result<(), P2pError>;
}
