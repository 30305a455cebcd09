//! The push-sync protocol: moving a chunk to where it belongs.
//!
//! The pusher hands a chunk to the connected peer closest to its address
//! and waits for a signed receipt. Every hop stores the chunk, forwards it
//! closer, settles accounting with both neighbors, and relays the receipt
//! of whichever node ended up with custody. A node that finds itself
//! closest keeps the chunk and signs the receipt itself.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod proto;

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Keccak256, Signature, B256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use asynchronous_codec::Framed;
use futures::{SinkExt, TryStreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, trace};
use voyager_accounting::{Accounting, AccountingError, Pricer};
use voyager_localstore::{ModePut, StorageError, Storer};
use voyager_p2p::{BoxStream, CodecError, P2pError, Peer, ProstCodec, ProtocolId, ProtocolSpec,
    StreamSpec, Streamer};
use voyager_primitives::{
    overlay_address, AnyChunk, ChunkError, SwarmAddress, HASH_SIZE, SIGNATURE_SIZE,
};
use voyager_tags::{Tag, TagState};
use voyager_topology::{ClosestPeerer, TopologyError};

/// Protocol name.
pub const PROTOCOL_NAME: &str = "pushsync";
/// Protocol version.
pub const PROTOCOL_VERSION: &str = "1.0.0";
/// The single push-sync stream.
pub const STREAM_NAME: &str = "pushsync";

const PUSHSYNC_PROTOCOL: ProtocolId = ProtocolId {
    name: PROTOCOL_NAME,
    version: PROTOCOL_VERSION,
    stream: STREAM_NAME,
};

/// Domain prefix of the receipt digest.
const RECEIPT_PREFIX: &[u8] = b"receipt";

/// Budget for one message read or write.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);
/// Message budget: one chunk with framing headroom.
const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Errors surfaced by push-sync.
#[derive(Debug, Error)]
pub enum PushSyncError {
    /// Opening the stream failed.
    #[error("new stream: {0}")]
    Stream(#[from] P2pError),
    /// Framing failure.
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    /// The peer did not answer within the budget.
    #[error("message timeout")]
    Timeout,
    /// There is nobody to push to and this node is not the closest.
    #[error("could not push chunk: no peers")]
    NoPush,
    /// The wire message carried a malformed address.
    #[error("invalid address in message")]
    InvalidAddress,
    /// The receipt does not vouch for the chunk.
    #[error("invalid receipt: {0}")]
    InvalidReceipt(&'static str),
    /// The delivered chunk failed validation.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// The local store refused the chunk.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Topology failure other than routing outcomes.
    #[error(transparent)]
    Topology(TopologyError),
    /// Accounting refused the hop.
    #[error(transparent)]
    Accounting(#[from] AccountingError),
    /// Signing a receipt failed.
    #[error("signer failure: {0}")]
    Signer(#[from] alloy_signer::Error),
}

impl PushSyncError {
    /// Whether the next-closest peer is worth a try.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            PushSyncError::Stream(_) | PushSyncError::Codec(_) | PushSyncError::Timeout
        )
    }
}

/// A verified custody acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// The chunk the receipt vouches for.
    pub address: SwarmAddress,
    /// Recoverable signature over the receipt digest.
    pub signature: Signature,
}

impl Receipt {
    /// Signs a receipt for `address`.
    pub fn sign(signer: &PrivateKeySigner, address: SwarmAddress) -> Result<Self, PushSyncError> {
        let signature = signer.sign_hash_sync(&receipt_digest(&address))?;
        Ok(Self { address, signature })
    }

    /// The overlay of the node that signed the receipt.
    pub fn signer_overlay(&self, network_id: u64) -> Result<SwarmAddress, PushSyncError> {
        let eth = self
            .signature
            .recover_address_from_prehash(&receipt_digest(&self.address))
            .map_err(|_| PushSyncError::InvalidReceipt("unrecoverable signature"))?;
        Ok(overlay_address(&eth, network_id))
    }

    /// Verifies the receipt against the peer it came from.
    ///
    /// The signer is either the peer itself (it stored the chunk) or some
    /// node strictly closer to the chunk (the peer relayed a downstream
    /// receipt).
    pub fn verify(&self, peer: &SwarmAddress, network_id: u64) -> Result<(), PushSyncError> {
        let signer = self.signer_overlay(network_id)?;
        if signer == *peer || signer.closer(&self.address, peer) {
            Ok(())
        } else {
            Err(PushSyncError::InvalidReceipt("signer is not on the path"))
        }
    }
}

/// The receipt digest: `keccak256("receipt" || address)`.
fn receipt_digest(address: &SwarmAddress) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(RECEIPT_PREFIX);
    hasher.update(address);
    hasher.finalize()
}

/// The push-sync service.
pub struct PushSync {
    streamer: Arc<dyn Streamer>,
    topology: Arc<dyn ClosestPeerer>,
    store: Arc<dyn Storer>,
    accounting: Arc<dyn Accounting>,
    pricer: Arc<dyn Pricer>,
    signer: PrivateKeySigner,
    base: SwarmAddress,
    network_id: u64,
}

impl std::fmt::Debug for PushSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSync")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl PushSync {
    /// Creates the service.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        streamer: Arc<dyn Streamer>,
        topology: Arc<dyn ClosestPeerer>,
        store: Arc<dyn Storer>,
        accounting: Arc<dyn Accounting>,
        pricer: Arc<dyn Pricer>,
        signer: PrivateKeySigner,
        network_id: u64,
    ) -> Arc<Self> {
        let base = overlay_address(&signer.address(), network_id);
        Arc::new(Self {
            streamer,
            topology,
            store,
            accounting,
            pricer,
            signer,
            base,
            network_id,
        })
    }

    /// This node's overlay address.
    pub fn base(&self) -> &SwarmAddress {
        &self.base
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
                            .handle_delivery(peer, stream)
                            .await
                            .map_err(|err| err.into())
                    })
                }),
            }],
        }
    }

    /// Pushes a chunk toward its address and returns the receipt.
    ///
    /// When this node itself is the closest, the chunk is stored locally
    /// and a self-signed receipt returned. A transport failure is retried
    /// once with the next-closest peer. The tag, when present, counts the
    /// chunk as sent when a delivery goes out and as synced when its
    /// receipt is accepted.
    pub async fn push_chunk_to_closest(
        &self,
        chunk: &AnyChunk,
        tag: Option<&Tag>,
    ) -> Result<Receipt, PushSyncError> {
        self.push(chunk, Vec::new(), true, tag).await
    }

    async fn push(
        &self,
        chunk: &AnyChunk,
        mut skip: Vec<SwarmAddress>,
        origin: bool,
        tag: Option<&Tag>,
    ) -> Result<Receipt, PushSyncError> {
        let address = chunk.address();
        let mut last_err: Option<PushSyncError> = None;

        for _ in 0..2 {
            let peer = match self.topology.closest_peer(&address, &skip) {
                Ok(peer) => peer,
                Err(TopologyError::WantSelf) => return self.store_and_sign(chunk).await,
                Err(TopologyError::NotFound) => {
                    if origin {
                        return Err(last_err.unwrap_or(PushSyncError::NoPush));
                    }
                    // A forwarder with no way further is the end of the
                    // road: keep the chunk and vouch for it.
                    return self.store_and_sign(chunk).await;
                }
                Err(err) => return Err(PushSyncError::Topology(err)),
            };

            match self.push_to_peer(&peer, &address, chunk, tag).await {
                Ok(receipt) => {
                    self.accounting
                        .credit(&peer, self.pricer.peer_price(&peer, &address))?;
                    if let Some(tag) = tag {
                        tag.inc(TagState::Synced);
                    }
                    return Ok(receipt);
                }
                Err(err) if err.is_transient() => {
                    debug!(%peer, %err, "push failed, trying next closest");
                    skip.push(peer);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.expect("loop exits early without a failure"))
    }

    async fn push_to_peer(
        &self,
        peer: &SwarmAddress,
        address: &SwarmAddress,
        chunk: &AnyChunk,
        tag: Option<&Tag>,
    ) -> Result<Receipt, PushSyncError> {
        let stream = self.streamer.new_stream(peer, PUSHSYNC_PROTOCOL).await?;

        let delivery = proto::Delivery {
            address: address.to_vec(),
            data: chunk.data().to_vec(),
        };
        let mut framed = Framed::new(stream, ProstCodec::<proto::Delivery>::new(MAX_MESSAGE_SIZE));
        trace!(%peer, %address, "sending chunk delivery");
        match timeout(MESSAGE_TIMEOUT, framed.send(delivery)).await {
            Err(_) => return Err(PushSyncError::Timeout),
            Ok(result) => result?,
        }
        // The delivery is on the wire; the chunk counts as sent even when
        // the receipt never arrives and a retry sends it again.
        if let Some(tag) = tag {
            tag.inc(TagState::Sent);
        }

        // The delivery write has completed; only now read the receipt.
        let mut framed = Framed::new(
            framed.into_inner(),
            ProstCodec::<proto::Receipt>::new(MAX_MESSAGE_SIZE),
        );
        let receipt = match timeout(MESSAGE_TIMEOUT, framed.try_next()).await {
            Err(_) => return Err(PushSyncError::Timeout),
            Ok(result) => result?.ok_or(PushSyncError::Timeout)?,
        };

        if receipt.address.len() != HASH_SIZE || receipt.signature.len() != SIGNATURE_SIZE {
            return Err(PushSyncError::InvalidReceipt("malformed fields"));
        }
        let receipt = Receipt {
            address: SwarmAddress::from_slice(&receipt.address),
            signature: Signature::try_from(receipt.signature.as_slice())
                .map_err(|_| PushSyncError::InvalidReceipt("malformed signature"))?,
        };
        if receipt.address != *address {
            return Err(PushSyncError::InvalidReceipt("address mismatch"));
        }
        receipt.verify(peer, self.network_id)?;
        Ok(receipt)
    }

    async fn store_and_sign(&self, chunk: &AnyChunk) -> Result<Receipt, PushSyncError> {
        let address = chunk.address();
        self.store.put(ModePut::Sync, &[chunk.clone()]).await?;
        debug!(%address, "chunk stored locally, self-signing receipt");
        Receipt::sign(&self.signer, address)
    }

    async fn handle_delivery(
        self: Arc<Self>,
        peer: Peer,
        stream: BoxStream,
    ) -> Result<(), PushSyncError> {
        let mut framed = Framed::new(stream, ProstCodec::<proto::Delivery>::new(MAX_MESSAGE_SIZE));
        let delivery = match timeout(MESSAGE_TIMEOUT, framed.try_next()).await {
            Err(_) => return Err(PushSyncError::Timeout),
            Ok(result) => result?.ok_or(PushSyncError::Timeout)?,
        };
        if delivery.address.len() != HASH_SIZE {
            return Err(PushSyncError::InvalidAddress);
        }
        let address = SwarmAddress::from_slice(&delivery.address);
        trace!(from = %peer.address, %address, "chunk delivery");

        // Validation failure resets the stream: an unsolicited or corrupt
        // chunk carries no receipt.
        let chunk = AnyChunk::parse_wire(&address, &delivery.data)?;
        self.store.put(ModePut::Request, &[chunk.clone()]).await?;
        self.accounting
            .debit(&peer.address, self.pricer.peer_price(&self.base, &address))?;

        // Forward hops run without a tag; tags track the originating
        // upload only.
        let receipt = self.push(&chunk, vec![peer.address], false, None).await?;

        let mut framed = Framed::new(
            framed.into_inner(),
            ProstCodec::<proto::Receipt>::new(MAX_MESSAGE_SIZE),
        );
        let wire = proto::Receipt {
            address: receipt.address.to_vec(),
            signature: receipt.signature.as_bytes().to_vec(),
        };
        match timeout(MESSAGE_TIMEOUT, framed.send(wire)).await {
            Err(_) => Err(PushSyncError::Timeout),
            Ok(result) => Ok(result?),
        }
    }
}

#[cfg(test)]
mod tests {
    use voyager_accounting::{BalanceAccounting, FixedPricer};
    use voyager_localstore::{LocalStore, ModeGet};
    use voyager_p2p::mock::MockNetwork;
    use voyager_primitives::{neighbour_at, ContentChunk};
    use voyager_statestore::MemStateStore;
    use voyager_tags::Tags;
    use voyager_topology::mock::MockTopology;

    use super::*;

    const NETWORK_ID: u64 = 1;

    struct Node {
        overlay: SwarmAddress,
        service: Arc<PushSync>,
        store: Arc<LocalStore>,
        accounting: Arc<BalanceAccounting>,
    }

    fn new_node(
        network: &Arc<MockNetwork>,
        signer: PrivateKeySigner,
        peers: Vec<SwarmAddress>,
    ) -> Node {
        let overlay = overlay_address(&signer.address(), NETWORK_ID);
        let store = Arc::new(LocalStore::default());
        let accounting = Arc::new(BalanceAccounting::new());
        let service = PushSync::new(
            Arc::new(network.streamer(overlay)),
            Arc::new(MockTopology::new(overlay, peers)),
            store.clone(),
            accounting.clone(),
            Arc::new(FixedPricer::default()),
            signer,
            NETWORK_ID,
        );
        network.register(overlay, service.protocol());
        Node {
            overlay,
            service,
            store,
            accounting,
        }
    }

    /// Draws a signer whose overlay proximity to `target` lies in
    /// `[min_po, max_po)`.
    fn signer_between(target: &SwarmAddress, min_po: u8, max_po: u8) -> PrivateKeySigner {
        loop {
            let signer = PrivateKeySigner::random();
            let po = overlay_address(&signer.address(), NETWORK_ID).proximity(target);
            if po >= min_po && po < max_po {
                return signer;
            }
        }
    }

    fn signer_near(target: &SwarmAddress, po: u8) -> PrivateKeySigner {
        signer_between(target, po, u8::MAX)
    }

    fn signer_far(target: &SwarmAddress) -> PrivateKeySigner {
        loop {
            let signer = PrivateKeySigner::random();
            if overlay_address(&signer.address(), NETWORK_ID).proximity(target) == 0 {
                return signer;
            }
        }
    }

    #[tokio::test]
    async fn two_hop_forwarding_with_final_custody_receipt() {
        let chunk: AnyChunk = ContentChunk::new(b"voyager chunk payload".to_vec())
            .unwrap()
            .into();
        let address = chunk.address();

        let network = MockNetwork::new();
        // C is very close to the chunk, B strictly in between, A far away.
        let signer_c = signer_near(&address, 6);
        let signer_b = signer_between(&address, 2, 6);
        let signer_a = signer_far(&address);
        let overlay_b = overlay_address(&signer_b.address(), NETWORK_ID);
        let overlay_c = overlay_address(&signer_c.address(), NETWORK_ID);

        let c = new_node(&network, signer_c, vec![overlay_b]);
        let b = new_node(&network, signer_b, vec![overlay_c]);
        let a = new_node(&network, signer_a, vec![overlay_b]);

        let receipt = a.service.push_chunk_to_closest(&chunk, None).await.unwrap();

        // The final receipt vouches for the chunk and recovers C, the node
        // that kept custody.
        assert_eq!(receipt.address, address);
        assert_eq!(receipt.signer_overlay(NETWORK_ID).unwrap(), c.overlay);

        // Both hops stored the chunk.
        assert!(b.store.get(ModeGet::Lookup, &address).await.is_ok());
        assert!(c.store.get(ModeGet::Lookup, &address).await.is_ok());

        // Accounting balances mirror each hop.
        let pricer = FixedPricer::default();
        let p_ab = pricer.peer_price(&b.overlay, &address) as i64;
        let p_bc = pricer.peer_price(&c.overlay, &address) as i64;
        assert_eq!(a.accounting.balance(&b.overlay), -p_ab);
        assert_eq!(b.accounting.balance(&a.overlay), p_ab);
        assert_eq!(b.accounting.balance(&c.overlay), -p_bc);
        assert_eq!(c.accounting.balance(&b.overlay), p_bc);
    }

    #[tokio::test]
    async fn tag_counts_sent_and_synced() {
        let chunk: AnyChunk = ContentChunk::new(b"tagged upload".to_vec()).unwrap().into();
        let address = chunk.address();

        let network = MockNetwork::new();
        let signer_holder = signer_near(&address, 4);
        let overlay_holder = overlay_address(&signer_holder.address(), NETWORK_ID);
        let _holder = new_node(&network, signer_holder, Vec::new());
        let origin = new_node(&network, signer_far(&address), vec![overlay_holder]);

        let tags = Tags::new(Arc::new(MemStateStore::new())).unwrap();
        let tag = tags.create().unwrap();

        origin
            .service
            .push_chunk_to_closest(&chunk, Some(tag.as_ref()))
            .await
            .unwrap();

        assert_eq!(tag.get(voyager_tags::TagState::Sent), 1);
        assert_eq!(tag.get(voyager_tags::TagState::Synced), 1);
    }

    #[tokio::test]
    async fn self_custody_does_not_count_as_sent() {
        let chunk: AnyChunk = ContentChunk::new(b"kept at home".to_vec()).unwrap().into();
        let address = chunk.address();

        let network = MockNetwork::new();
        let signer = signer_near(&address, 4);
        let node = new_node(&network, signer, vec![neighbour_at(&address, 0)]);

        let tags = Tags::new(Arc::new(MemStateStore::new())).unwrap();
        let tag = tags.create().unwrap();

        node.service
            .push_chunk_to_closest(&chunk, Some(tag.as_ref()))
            .await
            .unwrap();

        // Nothing crossed the wire; the chunk stayed with its custodian.
        assert_eq!(tag.get(voyager_tags::TagState::Sent), 0);
        assert_eq!(tag.get(voyager_tags::TagState::Synced), 0);
    }

    #[tokio::test]
    async fn want_self_stores_and_self_signs() {
        let chunk: AnyChunk = ContentChunk::new(b"self custody".to_vec()).unwrap().into();
        let address = chunk.address();

        let network = MockNetwork::new();
        let signer = signer_near(&address, 4);
        // The only connected peer is far from the chunk, so the node wins.
        let far = neighbour_at(&address, 0);
        let node = new_node(&network, signer, vec![far]);

        // No handler registered for `far`: reaching it would fail loudly.
        let receipt = node.service.push_chunk_to_closest(&chunk, None).await;
        // With `far` connected but farther than the node, topology answers
        // WantSelf only if the node is closer; craft guarantees PO >= 4 vs 0.
        let receipt = receipt.unwrap();
        assert_eq!(receipt.signer_overlay(NETWORK_ID).unwrap(), node.overlay);
        assert!(node.store.get(ModeGet::Lookup, &address).await.is_ok());
    }

    #[tokio::test]
    async fn no_peers_is_no_push() {
        let chunk: AnyChunk = ContentChunk::new(b"nowhere to go".to_vec()).unwrap().into();
        let network = MockNetwork::new();
        let node = new_node(&network, PrivateKeySigner::random(), Vec::new());

        let err = node.service.push_chunk_to_closest(&chunk, None).await.unwrap_err();
        assert!(matches!(err, PushSyncError::NoPush));
    }

    #[tokio::test]
    async fn transport_failure_retries_next_closest() {
        let chunk: AnyChunk = ContentChunk::new(b"retry me".to_vec()).unwrap().into();
        let address = chunk.address();

        let network = MockNetwork::new();
        let signer_good = signer_near(&address, 3);
        let overlay_good = overlay_address(&signer_good.address(), NETWORK_ID);
        // A dead peer strictly closer to the chunk than the good one:
        // picked first, but no handler serves it.
        let dead = neighbour_at(&address, overlay_good.proximity(&address) + 1);

        let good = new_node(&network, signer_good, Vec::new());
        // `good` self-signs: its topology has nobody to forward to besides
        // the upstream, which is skipped.
        let origin = new_node(
            &network,
            signer_far(&address),
            vec![dead, good.overlay],
        );

        let receipt = origin.service.push_chunk_to_closest(&chunk, None).await.unwrap();
        assert_eq!(
            receipt.signer_overlay(NETWORK_ID).unwrap(),
            good.overlay
        );
    }

    #[tokio::test]
    async fn receipt_from_unrelated_signer_is_rejected() {
        let address = SwarmAddress::new([0x42; 32]);
        let receipt = Receipt::sign(&PrivateKeySigner::random(), address).unwrap();
        let unrelated_peer = neighbour_at(&address, 24);
        // The random signer's overlay is almost surely farther than a
        // 20-bit neighbor of the address.
        assert!(receipt.verify(&unrelated_peer, NETWORK_ID).is_err());
    }

    #[tokio::test]
    async fn receipt_signature_roundtrip() {
        let signer = PrivateKeySigner::random();
        let address = SwarmAddress::new([0x17; 32]);
        let receipt = Receipt::sign(&signer, address).unwrap();
        let overlay = overlay_address(&signer.address(), NETWORK_ID);
        assert_eq!(receipt.signer_overlay(NETWORK_ID).unwrap(), overlay);
        receipt.verify(&overlay, NETWORK_ID).unwrap();
    }
}
