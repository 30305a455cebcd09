//! The topology driver.
//!
//! Keeps the connected-peer set partitioned into proximity bins, computes
//! the neighborhood depth, dials peers until shallow bins saturate and the
//! keyspace is covered prefix-balanced, and answers closest-peer queries
//! for the forwarding protocols.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod pslice;
pub use pslice::{BinIter, PSlice};
mod kademlia;
pub use kademlia::{BinInfo, Kademlia, KademliaConfig, KademliaSnapshot};
pub mod mock;

use async_trait::async_trait;
use thiserror::Error;
use voyager_addressbook::{AddressBook, AddressBookError};
use voyager_primitives::{NodeRecord, SwarmAddress};

/// Errors surfaced by topology queries and callbacks.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// No peer qualifies.
    #[error("no peer found")]
    NotFound,
    /// The base address itself is the closest to the target.
    #[error("node is the closest to the address")]
    WantSelf,
    /// The relevant bin has no room for another inbound connection.
    #[error("oversaturated")]
    Oversaturated,
    /// Address-book failure.
    #[error(transparent)]
    Book(#[from] AddressBookError),
    /// Announcing the peer failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Gossip seam: how a new peer is announced to the rest of the network.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Informs `addressee` about `peers`.
    async fn broadcast_peers(
        &self,
        addressee: &SwarmAddress,
        peers: Vec<SwarmAddress>,
    ) -> Result<(), DiscoveryError>;
}

/// Failure of a gossip broadcast.
#[derive(Debug, Error)]
#[error("discovery: {0}")]
pub struct DiscoveryError(pub String);

/// Closest-peer selection, the seam the forwarding protocols build on.
pub trait ClosestPeerer: Send + Sync + 'static {
    /// The connected peer closest to `target`, ignoring `skip`.
    ///
    /// Returns [`TopologyError::WantSelf`] when the base address is closer
    /// than every connected peer, [`TopologyError::NotFound`] when no peer
    /// qualifies.
    fn closest_peer(
        &self,
        target: &SwarmAddress,
        skip: &[SwarmAddress],
    ) -> Result<SwarmAddress, TopologyError>;
}

/// The slice of the address book the topology relies on.
///
/// [`AddressBook`] implements this; tests inject crafted books.
pub trait PeerBook: Send + Sync + 'static {
    /// The record stored for `overlay`.
    fn get(&self, overlay: &SwarmAddress) -> Result<NodeRecord, AddressBookError>;
    /// Removes the record stored for `overlay`.
    fn remove(&self, overlay: &SwarmAddress) -> Result<(), AddressBookError>;
    /// Every overlay with a stored record.
    fn overlays(&self) -> Result<Vec<SwarmAddress>, AddressBookError>;
}

impl PeerBook for AddressBook {
    fn get(&self, overlay: &SwarmAddress) -> Result<NodeRecord, AddressBookError> {
        AddressBook::get(self, overlay)
    }

    fn remove(&self, overlay: &SwarmAddress) -> Result<(), AddressBookError> {
        AddressBook::remove(self, overlay)
    }

    fn overlays(&self) -> Result<Vec<SwarmAddress>, AddressBookError> {
        AddressBook::overlays(self)
    }
}
