//! The hive protocol: how peers learn about each other.
//!
//! Hive gossips signed peer records. Outbound, it resolves overlays through
//! the address book and sends them in batches of at most
//! [`MAX_BATCH_SIZE`]; inbound, every record is signature-verified before
//! it enters the address book and the topology's known set. Gossip makes no
//! prioritization decisions; it forwards whatever the topology announces.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod proto;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use asynchronous_codec::Framed;
use futures::{AsyncWriteExt, SinkExt, TryStreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use voyager_addressbook::{AddressBook, AddressBookError};
use voyager_p2p::{BoxStream, CodecError, Peer, ProstCodec, ProtocolId, ProtocolSpec, Streamer,
    StreamSpec};
use voyager_primitives::{NodeRecord, SwarmAddress};
use voyager_topology::{Discovery, DiscoveryError};

/// Protocol name.
pub const PROTOCOL_NAME: &str = "hive";
/// Protocol version.
pub const PROTOCOL_VERSION: &str = "1.0.0";
/// Stream carrying peer batches.
pub const PEERS_STREAM: &str = "peers";

/// Most records per message.
pub const MAX_BATCH_SIZE: usize = 30;

/// Budget for reading or writing one message.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
/// Message budget: a full batch of records with growth headroom.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const PEERS_PROTOCOL: ProtocolId = ProtocolId {
    name: PROTOCOL_NAME,
    version: PROTOCOL_VERSION,
    stream: PEERS_STREAM,
};

/// Errors surfaced by hive.
#[derive(Debug, Error)]
pub enum HiveError {
    /// Opening the gossip stream failed.
    #[error("new stream: {0}")]
    Stream(#[from] voyager_p2p::P2pError),
    /// Framing failure on the stream.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// The peer did not produce a message within the budget.
    #[error("message timeout")]
    Timeout,
    /// Address-book failure while resolving records.
    #[error(transparent)]
    Book(AddressBookError),
}

type AddPeersHandler = Box<dyn Fn(Vec<SwarmAddress>) + Send + Sync>;

/// The hive gossip service.
pub struct Hive {
    streamer: Arc<dyn Streamer>,
    book: AddressBook,
    network_id: u64,
    add_peers_handler: RwLock<Option<AddPeersHandler>>,
}

impl std::fmt::Debug for Hive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hive")
            .field("network_id", &self.network_id)
            .finish_non_exhaustive()
    }
}

impl Hive {
    /// Creates the service.
    pub fn new(streamer: Arc<dyn Streamer>, book: AddressBook, network_id: u64) -> Arc<Self> {
        Arc::new(Self {
            streamer,
            book,
            network_id,
            add_peers_handler: RwLock::new(None),
        })
    }

    /// Wires verified inbound overlays into the topology's known set.
    pub fn set_add_peers_handler(&self, handler: impl Fn(Vec<SwarmAddress>) + Send + Sync + 'static) {
        *self.add_peers_handler.write() = Some(Box::new(handler));
    }

    /// The protocol served by this node.
    pub fn protocol(self: &Arc<Self>) -> ProtocolSpec {
        let hive = Arc::clone(self);
        ProtocolSpec {
            name: PROTOCOL_NAME,
            version: PROTOCOL_VERSION,
            streams: vec![StreamSpec {
                name: PEERS_STREAM,
                handler: Arc::new(move |peer, stream| {
                    let hive = Arc::clone(&hive);
                    Box::pin(async move { hive.handle_peers(peer, stream).await })
                }),
            }],
        }
    }

    /// Informs `addressee` about `peers`, batched.
    pub async fn broadcast(
        &self,
        addressee: &SwarmAddress,
        peers: &[SwarmAddress],
    ) -> Result<(), HiveError> {
        for batch in peers.chunks(MAX_BATCH_SIZE) {
            self.send_peers(addressee, batch).await?;
        }
        Ok(())
    }

    async fn send_peers(
        &self,
        addressee: &SwarmAddress,
        batch: &[SwarmAddress],
    ) -> Result<(), HiveError> {
        let mut message = proto::Peers::default();
        for overlay in batch {
            let record = match self.book.get(overlay) {
                Ok(record) => record,
                Err(AddressBookError::NotFound) => {
                    debug!(peer = %overlay, "peer not in the addressbook, skipping");
                    continue;
                }
                Err(err) => return Err(HiveError::Book(err)),
            };
            message.peers.push(proto::Record {
                overlay: record.overlay().to_vec(),
                underlay: record.underlay().to_vec(),
                signature: record.signature_bytes().to_vec(),
            });
        }
        if message.peers.is_empty() {
            return Ok(());
        }

        let stream = self.streamer.new_stream(addressee, PEERS_PROTOCOL).await?;
        let mut framed = Framed::new(stream, ProstCodec::<proto::Peers>::new(MAX_MESSAGE_SIZE));
        match timeout(MESSAGE_TIMEOUT, framed.send(message)).await {
            Err(_) => return Err(HiveError::Timeout),
            Ok(result) => result?,
        }
        // One-shot: close the write side and we are done.
        let _ = framed.close().await;
        trace!(%addressee, count = batch.len(), "gossiped peers");
        Ok(())
    }

    async fn handle_peers(
        self: Arc<Self>,
        peer: Peer,
        stream: BoxStream,
    ) -> voyager_p2p::HandlerResult {
        let mut framed = Framed::new(stream, ProstCodec::<proto::Peers>::new(MAX_MESSAGE_SIZE));
        let message = match timeout(MESSAGE_TIMEOUT, framed.try_next()).await {
            Err(_) => return Err(Box::new(HiveError::Timeout)),
            Ok(result) => result
                .map_err(HiveError::from)?
                .ok_or(HiveError::Timeout)?,
        };
        // Unblock the sending side before verifying.
        let mut stream = framed.into_inner();
        let _ = stream.close().await;

        let mut verified = Vec::with_capacity(message.peers.len());
        for record in &message.peers {
            let parsed = match NodeRecord::parse(
                &record.underlay,
                &record.overlay,
                &record.signature,
                self.network_id,
            ) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(from = %peer.address, %err, "skipping invalid peer record");
                    continue;
                }
            };
            if let Err(err) = self.book.put(parsed.overlay(), &parsed) {
                warn!(from = %peer.address, %err, "skipping unstorable peer record");
                continue;
            }
            verified.push(*parsed.overlay());
        }

        if !verified.is_empty() {
            if let Some(handler) = self.add_peers_handler.read().as_ref() {
                handler(verified);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for Hive {
    async fn broadcast_peers(
        &self,
        addressee: &SwarmAddress,
        peers: Vec<SwarmAddress>,
    ) -> Result<(), DiscoveryError> {
        self.broadcast(addressee, &peers)
            .await
            .map_err(|err| DiscoveryError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use alloy_signer_local::PrivateKeySigner;
    use libp2p::Multiaddr;
    use parking_lot::Mutex;
    use voyager_p2p::mock::MockNetwork;
    use voyager_statestore::MemStateStore;

    use super::*;

    const NETWORK_ID: u64 = 1;

    fn new_book() -> AddressBook {
        AddressBook::new(Arc::new(MemStateStore::new()), NETWORK_ID)
    }

    fn new_record(port: u16) -> NodeRecord {
        let signer = PrivateKeySigner::random();
        let underlay: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();
        NodeRecord::new(&signer, underlay, NETWORK_ID).unwrap()
    }

    struct Node {
        overlay: SwarmAddress,
        hive: Arc<Hive>,
        book: AddressBook,
        received: Arc<Mutex<Vec<Vec<SwarmAddress>>>>,
    }

    fn new_node(network: &Arc<MockNetwork>, tag: u8) -> Node {
        let overlay = SwarmAddress::new([tag; 32]);
        let book = new_book();
        let hive = Hive::new(
            Arc::new(network.streamer(overlay)),
            book.clone(),
            NETWORK_ID,
        );
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        hive.set_add_peers_handler(move |peers| sink.lock().push(peers));
        network.register(overlay, hive.protocol());
        Node {
            overlay,
            hive,
            book,
            received,
        }
    }

    async fn drain() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_verified_records() {
        let network = MockNetwork::new();
        let a = new_node(&network, 1);
        let b = new_node(&network, 2);

        let records: Vec<NodeRecord> = (0..3).map(|i| new_record(1000 + i)).collect();
        for record in &records {
            a.book.put(record.overlay(), record).unwrap();
        }
        let overlays: Vec<SwarmAddress> = records.iter().map(|r| *r.overlay()).collect();

        a.hive.broadcast(&b.overlay, &overlays).await.unwrap();
        drain().await;

        for record in &records {
            assert_eq!(b.book.get(record.overlay()).unwrap(), *record);
        }
        let received = b.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], overlays);
    }

    #[tokio::test]
    async fn broadcast_batches_thirty_per_message() {
        let network = MockNetwork::new();
        let a = new_node(&network, 1);
        let b = new_node(&network, 2);

        let records: Vec<NodeRecord> = (0..70).map(|i| new_record(2000 + i)).collect();
        for record in &records {
            a.book.put(record.overlay(), record).unwrap();
        }
        let overlays: Vec<SwarmAddress> = records.iter().map(|r| *r.overlay()).collect();

        a.hive.broadcast(&b.overlay, &overlays).await.unwrap();
        drain().await;

        // Handler tasks may finish in any order; only the batch shape is
        // guaranteed.
        let mut sizes: Vec<usize> = b.received.lock().iter().map(Vec::len).collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(sizes, vec![30, 30, 10]);
    }

    #[tokio::test]
    async fn invalid_records_are_dropped() {
        let network = MockNetwork::new();
        let a = new_node(&network, 1);
        let b = new_node(&network, 2);

        // A record signed for a different network does not verify at B.
        let signer = PrivateKeySigner::random();
        let underlay: Multiaddr = "/ip4/127.0.0.1/tcp/3000".parse().unwrap();
        let foreign = NodeRecord::new(&signer, underlay, NETWORK_ID + 1).unwrap();
        let good = new_record(3001);

        // The foreign record must bypass A's own verification to reach the
        // wire at all, so it is sent from a hive bound to the other network.
        a.book.put(good.overlay(), &good).unwrap();
        let book_with_foreign = AddressBook::new(Arc::new(MemStateStore::new()), NETWORK_ID + 1);
        book_with_foreign.put(foreign.overlay(), &foreign).unwrap();
        let sender = Hive::new(
            Arc::new(network.streamer(a.overlay)),
            book_with_foreign,
            NETWORK_ID + 1,
        );

        sender
            .broadcast(&b.overlay, &[*foreign.overlay()])
            .await
            .unwrap();
        a.hive
            .broadcast(&b.overlay, &[*good.overlay()])
            .await
            .unwrap();
        drain().await;

        assert!(b.book.get(foreign.overlay()).is_err());
        assert!(b.book.get(good.overlay()).is_ok());
        let received = b.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], vec![*good.overlay()]);
    }

    #[tokio::test]
    async fn unknown_overlays_are_skipped_on_send() {
        let network = MockNetwork::new();
        let a = new_node(&network, 1);
        let b = new_node(&network, 2);

        // Nothing in A's book: the broadcast is a no-op, not an error.
        a.hive
            .broadcast(&b.overlay, &[SwarmAddress::new([9; 32])])
            .await
            .unwrap();
        drain().await;
        assert!(b.received.lock().is_empty());
    }
}
