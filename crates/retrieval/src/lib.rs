//! The retrieval protocol: pulling a chunk the node does not hold.
//!
//! On a local miss the fetcher walks connected peers closest-to-the-address
//! first, requests the chunk, and validates every delivery against the
//! address before accepting it. A peer that misbehaves or simply does not
//! have the chunk is skipped and the next-closest one tried, until the
//! candidate set is exhausted.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod proto;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use asynchronous_codec::Framed;
use futures::{SinkExt, TryStreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, trace};
use voyager_accounting::{Accounting, AccountingError, Pricer};
use voyager_localstore::{ModeGet, StorageError, Storer};
use voyager_p2p::{BoxStream, CodecError, P2pError, Peer, ProstCodec, ProtocolId, ProtocolSpec,
    StreamSpec, Streamer};
use voyager_primitives::{AnyChunk, ChunkError, SwarmAddress, HASH_SIZE};
use voyager_topology::{ClosestPeerer, TopologyError};

/// Protocol name.
pub const PROTOCOL_NAME: &str = "retrieval";
/// Protocol version.
pub const PROTOCOL_VERSION: &str = "1.0.0";
/// The single retrieval stream.
pub const STREAM_NAME: &str = "retrieval";

const RETRIEVAL_PROTOCOL: ProtocolId = ProtocolId {
    name: PROTOCOL_NAME,
    version: PROTOCOL_VERSION,
    stream: STREAM_NAME,
};

/// Budget for one message read or write.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
/// Message budget: one chunk with framing headroom.
const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Errors surfaced by retrieval.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Opening the stream failed.
    #[error("new stream: {0}")]
    Stream(#[from] P2pError),
    /// Framing failure.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// The peer did not answer within the budget.
    #[error("message timeout")]
    Timeout,
    /// Every candidate peer was tried without a valid delivery.
    #[error("chunk not found in the network")]
    ChunkNotFound,
    /// The wire message carried a malformed address.
    #[error("invalid address in message")]
    InvalidAddress,
    /// A delivery failed validation against the requested address.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// Local store failure while serving a request.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Topology failure other than routing outcomes.
    #[error(transparent)]
    Topology(TopologyError),
    /// Accounting refused the transfer.
    #[error(transparent)]
    Accounting(#[from] AccountingError),
}

/// The seam the netstore pulls through.
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// Fetches and validates the chunk at `address` from the network.
    async fn retrieve_chunk(&self, address: &SwarmAddress) -> Result<AnyChunk, RetrievalError>;
}

/// The retrieval service.
pub struct Retrieval {
    streamer: Arc<dyn Streamer>,
    topology: Arc<dyn ClosestPeerer>,
    store: Arc<dyn Storer>,
    accounting: Arc<dyn Accounting>,
    pricer: Arc<dyn Pricer>,
    base: SwarmAddress,
}

impl std::fmt::Debug for Retrieval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrieval")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl Retrieval {
    /// Creates the service. `store` is what inbound requests are served
    /// from; handing a netstore here makes the node forward cache misses.
    pub fn new(
        base: SwarmAddress,
        streamer: Arc<dyn Streamer>,
        topology: Arc<dyn ClosestPeerer>,
        store: Arc<dyn Storer>,
        accounting: Arc<dyn Accounting>,
        pricer: Arc<dyn Pricer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            streamer,
            topology,
            store,
            accounting,
            pricer,
            base,
        })
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
                        service
                            .handle_request(peer, stream)
                            .await
                            .map_err(|err| err.into())
                    })
                }),
            }],
        }
    }

    async fn request_from(
        &self,
        peer: &SwarmAddress,
        address: &SwarmAddress,
    ) -> Result<AnyChunk, RetrievalError> {
        let stream = self.streamer.new_stream(peer, RETRIEVAL_PROTOCOL).await?;
        let mut framed = Framed::new(stream, ProstCodec::<proto::Request>::new(MAX_MESSAGE_SIZE));
        trace!(%peer, %address, "requesting chunk");
        let request = proto::Request {
            address: address.to_vec(),
        };
        match timeout(MESSAGE_TIMEOUT, framed.send(request)).await {
            Err(_) => return Err(RetrievalError::Timeout),
            Ok(result) => result?,
        }

        let mut framed = Framed::new(
            framed.into_inner(),
            ProstCodec::<proto::Delivery>::new(MAX_MESSAGE_SIZE),
        );
        let delivery = match timeout(MESSAGE_TIMEOUT, framed.try_next()).await {
            Err(_) => return Err(RetrievalError::Timeout),
            Ok(result) => result?.ok_or(RetrievalError::Timeout)?,
        };

        // A delivery is only as good as its validation.
        Ok(AnyChunk::parse_wire(address, &delivery.data)?)
    }

    async fn handle_request(
        self: Arc<Self>,
        peer: Peer,
        stream: BoxStream,
    ) -> Result<(), RetrievalError> {
        let mut framed = Framed::new(stream, ProstCodec::<proto::Request>::new(MAX_MESSAGE_SIZE));
        let request = match timeout(MESSAGE_TIMEOUT, framed.try_next()).await {
            Err(_) => return Err(RetrievalError::Timeout),
            Ok(result) => result?.ok_or(RetrievalError::Timeout)?,
        };
        if request.address.len() != HASH_SIZE {
            return Err(RetrievalError::InvalidAddress);
        }
        let address = SwarmAddress::from_slice(&request.address);
        trace!(from = %peer.address, %address, "chunk request");

        let chunk = self.store.get(ModeGet::Request, &address).await?;
        self.accounting
            .debit(&peer.address, self.pricer.peer_price(&self.base, &address))?;

        let mut framed = Framed::new(
            framed.into_inner(),
            ProstCodec::<proto::Delivery>::new(MAX_MESSAGE_SIZE),
        );
        let delivery = proto::Delivery {
            data: chunk.data().to_vec(),
        };
        match timeout(MESSAGE_TIMEOUT, framed.send(delivery)).await {
            Err(_) => Err(RetrievalError::Timeout),
            Ok(result) => Ok(result?),
        }
    }
}

#[async_trait]
impl Retriever for Retrieval {
    /// Walks candidate peers closest first until one produces a valid
    /// chunk; every failure extends the skip list.
    async fn retrieve_chunk(&self, address: &SwarmAddress) -> Result<AnyChunk, RetrievalError> {
        let mut skip: Vec<SwarmAddress> = Vec::new();
        loop {
            let peer = match self.topology.closest_peer(address, &skip) {
                Ok(peer) => peer,
                Err(TopologyError::NotFound | TopologyError::WantSelf) => {
                    debug!(%address, tried = skip.len(), "retrieval candidates exhausted");
                    return Err(RetrievalError::ChunkNotFound);
                }
                Err(err) => return Err(RetrievalError::Topology(err)),
            };

            match self.request_from(&peer, address).await {
                Ok(chunk) => {
                    self.accounting
                        .credit(&peer, self.pricer.peer_price(&peer, address))?;
                    return Ok(chunk);
                }
                Err(err) => {
                    debug!(%peer, %address, %err, "retrieval attempt failed, skipping peer");
                    skip.push(peer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::B256;
    use alloy_signer_local::PrivateKeySigner;
    use futures::AsyncWriteExt;
    use voyager_accounting::{BalanceAccounting, FixedPricer};
    use voyager_localstore::{LocalStore, ModePut};
    use voyager_p2p::mock::MockNetwork;
    use voyager_primitives::{neighbour_at, ContentChunk, SingleOwnerChunk};
    use voyager_topology::mock::MockTopology;

    use super::*;

    struct Node {
        overlay: SwarmAddress,
        service: Arc<Retrieval>,
        store: Arc<LocalStore>,
        accounting: Arc<BalanceAccounting>,
    }

    fn new_node(
        network: &Arc<MockNetwork>,
        overlay: SwarmAddress,
        peers: Vec<SwarmAddress>,
    ) -> Node {
        let store = Arc::new(LocalStore::default());
        let accounting = Arc::new(BalanceAccounting::new());
        let service = Retrieval::new(
            overlay,
            Arc::new(network.streamer(overlay)),
            Arc::new(MockTopology::new(overlay, peers)),
            store.clone(),
            accounting.clone(),
            Arc::new(FixedPricer::default()),
        );
        network.register(overlay, service.protocol());
        Node {
            overlay,
            service,
            store,
            accounting,
        }
    }

    fn test_chunk() -> AnyChunk {
        ContentChunk::new(b"retrievable payload".to_vec())
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn retrieves_from_closest_peer() {
        let chunk = test_chunk();
        let address = chunk.address();

        let network = MockNetwork::new();
        let holder_overlay = neighbour_at(&address, 4);
        let holder = new_node(&network, holder_overlay, Vec::new());
        holder
            .store
            .put(ModePut::Sync, &[chunk.clone()])
            .await
            .unwrap();

        let requester_overlay = neighbour_at(&address, 0);
        let requester = new_node(&network, requester_overlay, vec![holder_overlay]);

        let retrieved = requester.service.retrieve_chunk(&address).await.unwrap();
        assert_eq!(retrieved, chunk);

        let price = FixedPricer::default().peer_price(&holder.overlay, &address) as i64;
        assert_eq!(requester.accounting.balance(&holder.overlay), -price);
        assert_eq!(holder.accounting.balance(&requester.overlay), price);
    }

    #[tokio::test]
    async fn skips_peer_without_chunk() {
        let chunk = test_chunk();
        let address = chunk.address();

        let network = MockNetwork::new();
        // The empty peer is closer and gets asked first.
        let empty_overlay = neighbour_at(&address, 8);
        let holder_overlay = neighbour_at(&address, 4);
        let _empty = new_node(&network, empty_overlay, Vec::new());
        let holder = new_node(&network, holder_overlay, Vec::new());
        holder
            .store
            .put(ModePut::Sync, &[chunk.clone()])
            .await
            .unwrap();

        let requester = new_node(
            &network,
            neighbour_at(&address, 0),
            vec![empty_overlay, holder_overlay],
        );

        let retrieved = requester.service.retrieve_chunk(&address).await.unwrap();
        assert_eq!(retrieved, chunk);
    }

    #[tokio::test]
    async fn rejects_corrupt_delivery_and_tries_next() {
        let chunk = test_chunk();
        let address = chunk.address();

        let network = MockNetwork::new();
        // A liar closer than the honest holder: answers every request with
        // garbage bytes.
        let liar_overlay = neighbour_at(&address, 8);
        network.register(
            liar_overlay,
            ProtocolSpec {
                name: PROTOCOL_NAME,
                version: PROTOCOL_VERSION,
                streams: vec![StreamSpec {
                    name: STREAM_NAME,
                    handler: Arc::new(|_, stream| {
                        Box::pin(async move {
                            let mut framed = Framed::new(
                                stream,
                                ProstCodec::<proto::Request>::new(MAX_MESSAGE_SIZE),
                            );
                            let _ = framed.try_next().await?;
                            let mut framed = Framed::new(
                                framed.into_inner(),
                                ProstCodec::<proto::Delivery>::new(MAX_MESSAGE_SIZE),
                            );
                            framed
                                .send(proto::Delivery {
                                    data: b"\x08\x00\x00\x00\x00\x00\x00\x00not the chunk".to_vec(),
                                })
                                .await?;
                            framed.into_inner().close().await?;
                            Ok(())
                        })
                    }),
                }],
            },
        );

        let holder_overlay = neighbour_at(&address, 4);
        let holder = new_node(&network, holder_overlay, Vec::new());
        holder
            .store
            .put(ModePut::Sync, &[chunk.clone()])
            .await
            .unwrap();

        let requester = new_node(
            &network,
            neighbour_at(&address, 0),
            vec![liar_overlay, holder_overlay],
        );

        let retrieved = requester.service.retrieve_chunk(&address).await.unwrap();
        assert_eq!(retrieved, chunk);
        // The liar earned nothing.
        assert_eq!(requester.accounting.balance(&liar_overlay), 0);
    }

    #[tokio::test]
    async fn exhausted_candidates_is_chunk_not_found() {
        let chunk = test_chunk();
        let address = chunk.address();

        let network = MockNetwork::new();
        let empty_overlay = neighbour_at(&address, 6);
        let _empty = new_node(&network, empty_overlay, Vec::new());
        let requester = new_node(&network, neighbour_at(&address, 0), vec![empty_overlay]);

        let err = requester.service.retrieve_chunk(&address).await.unwrap_err();
        assert!(matches!(err, RetrievalError::ChunkNotFound));
    }

    #[tokio::test]
    async fn no_peers_is_chunk_not_found() {
        let network = MockNetwork::new();
        let requester = new_node(&network, SwarmAddress::new([1; 32]), Vec::new());
        let err = requester
            .service
            .retrieve_chunk(&SwarmAddress::new([2; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::ChunkNotFound));
    }

    #[tokio::test]
    async fn single_owner_chunks_validate_on_the_way_back() {
        let signer = PrivateKeySigner::random();
        let soc: AnyChunk = SingleOwnerChunk::new(B256::repeat_byte(9), b"owned data".to_vec(), &signer)
            .unwrap()
            .into();
        let address = soc.address();

        let network = MockNetwork::new();
        let holder_overlay = neighbour_at(&address, 4);
        let holder = new_node(&network, holder_overlay, Vec::new());
        holder.store.put(ModePut::Sync, &[soc.clone()]).await.unwrap();

        let requester = new_node(&network, neighbour_at(&address, 0), vec![holder_overlay]);
        let retrieved = requester.service.retrieve_chunk(&address).await.unwrap();
        assert_eq!(retrieved, soc);
    }
}
