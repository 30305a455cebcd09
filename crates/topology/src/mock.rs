//! Test doubles for the topology seams.

use std::collections::HashMap;

use libp2p::{multiaddr::Protocol, Multiaddr};
use parking_lot::Mutex;
use voyager_addressbook::AddressBookError;
use voyager_p2p::ConnectError;
use voyager_primitives::{neighbour_at, NodeRecord, SwarmAddress, HASH_SIZE, SIGNATURE_SIZE};

use crate::{ClosestPeerer, Discovery, DiscoveryError, PeerBook, TopologyError};

/// An in-memory peer book accepting crafted, unverified records.
///
/// The records it serves encode the peer's overlay in a DNS-shaped
/// underlay, so a scripted dialer can "authenticate" the right overlay with
/// [`MockPeerBook::overlay_from_underlay`].
#[derive(Debug, Default)]
pub struct MockPeerBook {
    records: Mutex<HashMap<SwarmAddress, NodeRecord>>,
}

impl MockPeerBook {
    /// Inserts a record for a random peer at proximity `po` from `base` and
    /// returns its overlay.
    pub fn insert_peer(&self, base: &SwarmAddress, po: u8) -> SwarmAddress {
        let overlay = neighbour_at(base, po);
        self.insert_overlay(overlay);
        overlay
    }

    /// Inserts a record for a crafted overlay: the closure reshapes a
    /// random address before insertion.
    pub fn insert_peer_with(&self, f: impl FnOnce(&mut SwarmAddress)) -> SwarmAddress {
        let mut overlay = SwarmAddress::from(alloy_primitives::B256::random());
        f(&mut overlay);
        self.insert_overlay(overlay);
        overlay
    }

    /// Inserts an unverified record for `overlay`.
    pub fn insert_overlay(&self, overlay: SwarmAddress) {
        let record = NodeRecord::new_unverified(
            overlay,
            Self::underlay_for(&overlay),
            dummy_signature(),
        );
        self.records.lock().insert(overlay, record);
    }

    /// The mock underlay of `overlay`: a DNS name carrying the hex overlay.
    pub fn underlay_for(overlay: &SwarmAddress) -> Multiaddr {
        let hex: String = overlay
            .as_slice()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("/dns/{hex}/tcp/1634").parse().expect("valid multiaddr")
    }

    /// Recovers the overlay a mock underlay encodes; the scripted dialer's
    /// stand-in for transport authentication.
    pub fn overlay_from_underlay(underlay: &Multiaddr) -> Result<SwarmAddress, ConnectError> {
        for protocol in underlay.iter() {
            if let Protocol::Dns(name) = protocol {
                let mut bytes = [0u8; HASH_SIZE];
                if name.len() != HASH_SIZE * 2 {
                    break;
                }
                for (i, byte) in bytes.iter_mut().enumerate() {
                    let pair = &name[i * 2..i * 2 + 2];
                    *byte = u8::from_str_radix(pair, 16)
                        .map_err(|_| ConnectError::Transport("bad mock underlay".into()))?;
                }
                return Ok(SwarmAddress::new(bytes));
            }
        }
        Err(ConnectError::Transport("bad mock underlay".into()))
    }
}

impl PeerBook for MockPeerBook {
    fn get(&self, overlay: &SwarmAddress) -> Result<NodeRecord, AddressBookError> {
        self.records
            .lock()
            .get(overlay)
            .cloned()
            .ok_or(AddressBookError::NotFound)
    }

    fn remove(&self, overlay: &SwarmAddress) -> Result<(), AddressBookError> {
        self.records.lock().remove(overlay);
        Ok(())
    }

    fn overlays(&self) -> Result<Vec<SwarmAddress>, AddressBookError> {
        Ok(self.records.lock().keys().copied().collect())
    }
}

/// Records every broadcast instead of gossiping.
#[derive(Debug, Default)]
pub struct MockDiscovery {
    broadcasts: Mutex<Vec<(SwarmAddress, Vec<SwarmAddress>)>>,
}

impl MockDiscovery {
    /// Every `(addressee, peers)` broadcast so far.
    pub fn broadcasts(&self) -> Vec<(SwarmAddress, Vec<SwarmAddress>)> {
        self.broadcasts.lock().clone()
    }
}

#[async_trait::async_trait]
impl Discovery for MockDiscovery {
    async fn broadcast_peers(
        &self,
        addressee: &SwarmAddress,
        peers: Vec<SwarmAddress>,
    ) -> Result<(), DiscoveryError> {
        self.broadcasts.lock().push((*addressee, peers));
        Ok(())
    }
}

/// Answers closest-peer queries over a fixed peer set.
#[derive(Debug, Default)]
pub struct MockTopology {
    base: SwarmAddress,
    peers: Mutex<Vec<SwarmAddress>>,
}

impl MockTopology {
    /// A topology with the given base address and connected peers.
    pub fn new(base: SwarmAddress, peers: Vec<SwarmAddress>) -> Self {
        Self {
            base,
            peers: Mutex::new(peers),
        }
    }
}

impl ClosestPeerer for MockTopology {
    fn closest_peer(
        &self,
        target: &SwarmAddress,
        skip: &[SwarmAddress],
    ) -> Result<SwarmAddress, TopologyError> {
        let peers = self.peers.lock();
        if peers.is_empty() {
            return Err(TopologyError::NotFound);
        }
        let mut closest = self.base;
        for peer in peers.iter() {
            if skip.contains(peer) {
                continue;
            }
            if peer.closer(target, &closest) {
                closest = *peer;
            }
        }
        if closest == self.base {
            return Err(TopologyError::WantSelf);
        }
        Ok(closest)
    }
}

fn dummy_signature() -> alloy_primitives::Signature {
    alloy_primitives::Signature::try_from(&[0u8; SIGNATURE_SIZE][..])
        .expect("65 zero bytes parse as a signature")
}
