//! The pingpong protocol: a liveness and latency probe.
//!
//! The pinger sends each greeting as its own message and expects the
//! echoed `{pong}` response; the measured wall time of the whole exchange
//! is the reported round-trip time.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod proto {
    //! Generated-style protobuf types for the pingpong wire format.

    /// A greeting to be echoed.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ping {
        /// Free-form greeting text.
        #[prost(string, tag = "1")]
        pub greeting: ::prost::alloc::string::String,
    }

    /// The echo of a greeting.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Pong {
        /// The echoed greeting wrapped in `{...}`.
        #[prost(string, tag = "1")]
        pub response: ::prost::alloc::string::String,
    }
}

use std::{sync::Arc, time::Duration};

use asynchronous_codec::Framed;
use futures::{SinkExt, TryStreamExt};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::trace;
use voyager_p2p::{BoxStream, CodecError, P2pError, Peer, ProstCodec, ProtocolId, ProtocolSpec,
    StreamSpec, Streamer};
use voyager_primitives::SwarmAddress;

/// Protocol name.
pub const PROTOCOL_NAME: &str = "pingpong";
/// Protocol version.
pub const PROTOCOL_VERSION: &str = "1.0.0";
/// The single pingpong stream.
pub const STREAM_NAME: &str = "pingpong";

const PINGPONG_PROTOCOL: ProtocolId = ProtocolId {
    name: PROTOCOL_NAME,
    version: PROTOCOL_VERSION,
    stream: STREAM_NAME,
};

/// Budget for one message read or write.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_MESSAGE_SIZE: usize = 4 * 1024;

/// Errors surfaced by pingpong.
#[derive(Debug, Error)]
pub enum PingPongError {
    /// Opening the stream failed.
    #[error("new stream: {0}")]
    Stream(#[from] P2pError),
    /// Framing failure.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// The peer did not answer within the budget.
    #[error("message timeout")]
    Timeout,
    /// The pong does not echo the ping.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(String),
}

/// The pingpong service.
pub struct PingPong {
    streamer: Arc<dyn Streamer>,
}

impl std::fmt::Debug for PingPong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingPong").finish_non_exhaustive()
    }
}

impl PingPong {
    /// Creates the service.
    pub fn new(streamer: Arc<dyn Streamer>) -> Arc<Self> {
        Arc::new(Self { streamer })
    }

    /// The protocol served by this node.
    pub fn protocol(self: &Arc<Self>) -> ProtocolSpec {
        let service = Arc::clone(self);
        ProtocolSpec {
            name: PROTOCOL_NAME,
            version: PROTOCOL_VERSION,
            streams: vec![StreamSpec {
                name: STREAM_NAME,
                handler: Arc::new(move |peer, stream| {
                    let service = Arc::clone(&service);
                    Box::pin(async move {
                        service.handle(peer, stream).await.map_err(|err| err.into())
                    })
                }),
            }],
        }
    }

    /// Sends each greeting and awaits its echo; returns the round-trip
    /// time of the whole exchange.
    pub async fn ping(
        &self,
        peer: &SwarmAddress,
        greetings: &[&str],
    ) -> Result<Duration, PingPongError> {
        let stream = self.streamer.new_stream(peer, PINGPONG_PROTOCOL).await?;
        let mut framed = Framed::new(stream, DirectedCodec::<proto::Ping, proto::Pong>::new());

        let start = Instant::now();
        for greeting in greetings {
            let ping = proto::Ping {
                greeting: (*greeting).to_string(),
            };
            match timeout(MESSAGE_TIMEOUT, framed.send(ping)).await {
                Err(_) => return Err(PingPongError::Timeout),
                Ok(result) => result?,
            }
            let pong = match timeout(MESSAGE_TIMEOUT, framed.try_next()).await {
                Err(_) => return Err(PingPongError::Timeout),
                Ok(result) => result?.ok_or(PingPongError::Timeout)?,
            };
            let expected = format!("{{{greeting}}}");
            if pong.response != expected {
                return Err(PingPongError::UnexpectedResponse(pong.response));
            }
            trace!(%peer, greeting, "pong received");
        }
        Ok(start.elapsed())
    }

    async fn handle(
        self: Arc<Self>,
        peer: Peer,
        stream: BoxStream,
    ) -> Result<(), PingPongError> {
        let mut framed = Framed::new(stream, DirectedCodec::<proto::Pong, proto::Ping>::new());
        loop {
            let ping = match timeout(MESSAGE_TIMEOUT, framed.try_next()).await {
                Err(_) => return Err(PingPongError::Timeout),
                Ok(result) => match result? {
                    None => return Ok(()),
                    Some(ping) => ping,
                },
            };
            trace!(from = %peer.address, greeting = %ping.greeting, "ping");
            let pong = proto::Pong {
                response: format!("{{{}}}", ping.greeting),
            };
            match timeout(MESSAGE_TIMEOUT, framed.send(pong)).await {
                Err(_) => return Err(PingPongError::Timeout),
                Ok(result) => result?,
            }
        }
    }
}

/// Frames one message type outbound and another inbound over the same
/// stream, one codec per side of the conversation.
#[derive(Debug)]
struct DirectedCodec<Out, In> {
    out: ProstCodec<Out>,
    incoming: ProstCodec<In>,
}

impl<Out, In> DirectedCodec<Out, In> {
    fn new() -> Self {
        Self {
            out: ProstCodec::new(MAX_MESSAGE_SIZE),
            incoming: ProstCodec::new(MAX_MESSAGE_SIZE),
        }
    }
}

impl<Out: prost::Message, In> asynchronous_codec::Encoder for DirectedCodec<Out, In> {
    type Item<'a> = Out;
    type Error = CodecError;

    fn encode(
        &mut self,
        item: Self::Item<'_>,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.out.encode(item, dst)
    }
}

impl<Out, In: prost::Message + Default> asynchronous_codec::Decoder for DirectedCodec<Out, In> {
    type Item = In;
    type Error = CodecError;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.incoming.decode(src)
    }
}
