//! In-memory transport used by protocol tests.
//!
//! A [`MockNetwork`] holds every node's registered protocols. A streamer
//! bound to a caller overlay connects duplex pipes straight to the callee's
//! handler, so multi-hop protocol scenarios run without sockets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::Multiaddr;
use parking_lot::Mutex;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::trace;
use voyager_primitives::SwarmAddress;

use crate::{
    BoxStream, ConnectError, P2pError, P2pService, Peer, ProtocolId, ProtocolSpec, Streamer,
};

/// Buffer size of the in-memory duplex pipes.
const PIPE_CAPACITY: usize = 1 << 20;

#[derive(Default)]
struct Registry {
    handlers: HashMap<(SwarmAddress, ProtocolId), crate::Handler>,
}

/// An in-memory network of protocol handlers keyed by overlay.
#[derive(Default)]
pub struct MockNetwork {
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNetwork").finish_non_exhaustive()
    }
}

impl MockNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node's protocol: inbound streams to `overlay` for any of
    /// the spec's streams are served by the spec's handlers.
    pub fn register(&self, overlay: SwarmAddress, spec: ProtocolSpec) {
        let mut registry = self.registry.lock();
        for stream in spec.streams {
            let id = ProtocolId {
                name: spec.name,
                version: spec.version,
                stream: stream.name,
            };
            registry.handlers.insert((overlay, id), stream.handler);
        }
    }

    /// A streamer that opens streams on behalf of `caller`.
    pub fn streamer(self: &Arc<Self>, caller: SwarmAddress) -> MockStreamer {
        MockStreamer {
            caller,
            network: Arc::clone(self),
        }
    }
}

/// Streamer half of the mock transport, bound to one caller overlay.
#[derive(Debug, Clone)]
pub struct MockStreamer {
    caller: SwarmAddress,
    network: Arc<MockNetwork>,
}

#[async_trait]
impl Streamer for MockStreamer {
    async fn new_stream(
        &self,
        peer: &SwarmAddress,
        protocol: ProtocolId,
    ) -> Result<BoxStream, P2pError> {
        let handler = self
            .network
            .registry
            .lock()
            .handlers
            .get(&(*peer, protocol))
            .cloned()
            .ok_or(P2pError::ProtocolNotSupported(protocol))?;

        trace!(caller = %self.caller, %peer, %protocol, "mock stream open");
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let remote = Peer {
            address: self.caller,
        };
        let _ = tokio::spawn(async move {
            if let Err(err) = handler(remote, Box::new(far.compat())).await {
                trace!(%err, "mock handler failed");
            }
        });
        Ok(Box::new(near.compat()))
    }
}

type ConnectFn =
    dyn Fn(&Multiaddr) -> Result<SwarmAddress, ConnectError> + Send + Sync + 'static;

/// Scripted dialer for topology tests.
///
/// Every `connect` consults the configured closure and is recorded; every
/// `disconnect` is recorded.
pub struct MockP2pService {
    connect_fn: Mutex<Box<ConnectFn>>,
    connects: Mutex<Vec<Multiaddr>>,
    disconnects: Mutex<Vec<SwarmAddress>>,
}

impl std::fmt::Debug for MockP2pService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockP2pService").finish_non_exhaustive()
    }
}

impl Default for MockP2pService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockP2pService {
    /// A dialer that fails every attempt.
    pub fn new() -> Self {
        Self {
            connect_fn: Mutex::new(Box::new(|_| {
                Err(ConnectError::Transport("no connect function".into()))
            })),
            connects: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        }
    }

    /// A dialer answering every attempt with `f`.
    pub fn with_connect_fn(
        f: impl Fn(&Multiaddr) -> Result<SwarmAddress, ConnectError> + Send + Sync + 'static,
    ) -> Self {
        let service = Self::new();
        *service.connect_fn.lock() = Box::new(f);
        service
    }

    /// Replaces the connect behavior.
    pub fn set_connect_fn(
        &self,
        f: impl Fn(&Multiaddr) -> Result<SwarmAddress, ConnectError> + Send + Sync + 'static,
    ) {
        *self.connect_fn.lock() = Box::new(f);
    }

    /// Underlays dialed so far.
    pub fn connect_calls(&self) -> Vec<Multiaddr> {
        self.connects.lock().clone()
    }

    /// Overlays disconnected so far.
    pub fn disconnect_calls(&self) -> Vec<SwarmAddress> {
        self.disconnects.lock().clone()
    }
}

#[async_trait]
impl P2pService for MockP2pService {
    async fn connect(&self, underlay: &Multiaddr) -> Result<SwarmAddress, ConnectError> {
        self.connects.lock().push(underlay.clone());
        (self.connect_fn.lock())(underlay)
    }

    async fn disconnect(&self, overlay: &SwarmAddress) -> Result<(), P2pError> {
        self.disconnects.lock().push(*overlay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::StreamSpec;

    const PROTOCOL: ProtocolId = ProtocolId {
        name: "echo",
        version: "1.0.0",
        stream: "echo",
    };

    fn echo_spec() -> ProtocolSpec {
        ProtocolSpec {
            name: "echo",
            version: "1.0.0",
            streams: vec![StreamSpec {
                name: "echo",
                handler: Arc::new(|_, mut stream| {
                    Box::pin(async move {
                        let mut buf = [0u8; 5];
                        stream.read_exact(&mut buf).await?;
                        stream.write_all(&buf).await?;
                        stream.close().await?;
                        Ok(())
                    })
                }),
            }],
        }
    }

    #[tokio::test]
    async fn stream_reaches_registered_handler() {
        let network = MockNetwork::new();
        let server = SwarmAddress::new([1; 32]);
        let client = SwarmAddress::new([2; 32]);
        network.register(server, echo_spec());

        let streamer = network.streamer(client);
        let mut stream = streamer.new_stream(&server, PROTOCOL).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn unknown_protocol_is_rejected() {
        let network = MockNetwork::new();
        let streamer = network.streamer(SwarmAddress::new([2; 32]));
        let err = streamer
            .new_stream(&SwarmAddress::new([1; 32]), PROTOCOL)
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::ProtocolNotSupported(_)));
    }

    #[tokio::test]
    async fn scripted_connects_are_recorded() {
        let overlay = SwarmAddress::new([7; 32]);
        let service = MockP2pService::with_connect_fn(move |_| Ok(overlay));
        let underlay: Multiaddr = "/ip4/127.0.0.1/tcp/1634".parse().unwrap();

        assert_eq!(service.connect(&underlay).await.unwrap(), overlay);
        assert_eq!(service.connect_calls(), vec![underlay]);

        service.disconnect(&overlay).await.unwrap();
        assert_eq!(service.disconnect_calls(), vec![overlay]);
    }
}
