//! Proximity-ordered peer storage.
//!
//! Peers live in bins indexed by their proximity order to the base address.
//! Iteration is deterministic: bins in PO order, addresses sorted within a
//! bin. The caller supplies the PO on insert; the slice itself is
//! base-address agnostic.

use std::collections::HashMap;

use parking_lot::RwLock;
use voyager_primitives::{SwarmAddress, MAX_BINS};

/// Flow control of a bin iteration callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinIter {
    /// Proceed with the next peer.
    Continue,
    /// Skip the remaining peers of the current bin.
    NextBin,
    /// Stop the iteration.
    Stop,
}

#[derive(Debug, Default)]
struct Bins {
    /// Sorted peer lists, one per bin.
    bins: Vec<Vec<SwarmAddress>>,
    /// Peer to bin index.
    index: HashMap<SwarmAddress, u8>,
}

/// Bin-indexed set of peer addresses.
#[derive(Debug)]
pub struct PSlice {
    inner: RwLock<Bins>,
}

impl Default for PSlice {
    fn default() -> Self {
        Self::new()
    }
}

impl PSlice {
    /// Creates an empty slice with [`MAX_BINS`] bins.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Bins {
                bins: vec![Vec::new(); MAX_BINS],
                index: HashMap::new(),
            }),
        }
    }

    /// Adds a peer to its bin. Returns false if it was already present.
    pub fn add(&self, peer: SwarmAddress, po: u8) -> bool {
        let mut inner = self.inner.write();
        if inner.index.contains_key(&peer) {
            return false;
        }
        inner.index.insert(peer, po);
        let bin = &mut inner.bins[po as usize];
        let pos = bin.binary_search(&peer).unwrap_err();
        bin.insert(pos, peer);
        true
    }

    /// Removes a peer. Returns false if it was not present.
    pub fn remove(&self, peer: &SwarmAddress) -> bool {
        let mut inner = self.inner.write();
        let Some(po) = inner.index.remove(peer) else {
            return false;
        };
        let bin = &mut inner.bins[po as usize];
        if let Ok(pos) = bin.binary_search(peer) {
            bin.remove(pos);
        }
        true
    }

    /// Whether the peer is present.
    pub fn exists(&self, peer: &SwarmAddress) -> bool {
        self.inner.read().index.contains_key(peer)
    }

    /// Total number of peers.
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Whether the slice holds no peers.
    pub fn is_empty(&self) -> bool {
        self.inner.read().index.is_empty()
    }

    /// Number of peers in `bin`.
    pub fn bin_size(&self, bin: u8) -> usize {
        self.inner.read().bins[bin as usize].len()
    }

    /// The peers of `bin`, in address order.
    pub fn bin_peers(&self, bin: u8) -> Vec<SwarmAddress> {
        self.inner.read().bins[bin as usize].clone()
    }

    /// The lowest PO with no peers, and whether no bin was empty at all.
    pub fn shallowest_empty(&self) -> (u8, bool) {
        let inner = self.inner.read();
        for (po, bin) in inner.bins.iter().enumerate() {
            if bin.is_empty() {
                return (po as u8, false);
            }
        }
        (0, true)
    }

    /// Iterates peers closest bin first (deepest PO down to 0).
    pub fn each_bin<E>(
        &self,
        mut f: impl FnMut(&SwarmAddress, u8) -> Result<BinIter, E>,
    ) -> Result<(), E> {
        let snapshot = self.snapshot();
        for (po, bin) in snapshot.iter().enumerate().rev() {
            for peer in bin {
                match f(peer, po as u8)? {
                    BinIter::Continue => {}
                    BinIter::NextBin => break,
                    BinIter::Stop => return Ok(()),
                }
            }
        }
        Ok(())
    }

    /// Iterates peers farthest bin first (PO 0 upwards).
    pub fn each_bin_rev<E>(
        &self,
        mut f: impl FnMut(&SwarmAddress, u8) -> Result<BinIter, E>,
    ) -> Result<(), E> {
        let snapshot = self.snapshot();
        for (po, bin) in snapshot.iter().enumerate() {
            for peer in bin {
                match f(peer, po as u8)? {
                    BinIter::Continue => {}
                    BinIter::NextBin => break,
                    BinIter::Stop => return Ok(()),
                }
            }
        }
        Ok(())
    }

    // Iteration works on a snapshot so callbacks may re-enter the slice.
    fn snapshot(&self) -> Vec<Vec<SwarmAddress>> {
        self.inner.read().bins.clone()
    }
}
