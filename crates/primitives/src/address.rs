use std::{cmp::Ordering, fmt, str::FromStr};

use alloy_primitives::{hex, B256, U256};
use serde::{Deserialize, Serialize};

use crate::{EXTENDED_PO, HASH_SIZE, MAX_PO};

/// A 32-byte address in the overlay keyspace.
///
/// Both node overlays and chunk addresses live in the same 256-bit keyspace
/// and are compared with the same XOR distance metric.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SwarmAddress(B256);

impl SwarmAddress {
    /// The all-zero address.
    pub const ZERO: Self = Self(B256::ZERO);

    /// Create an address from raw bytes.
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(B256::new(bytes))
    }

    /// Create an address from a slice.
    ///
    /// # Panics
    ///
    /// Panics if the slice is not exactly 32 bytes long. Wire decoders must
    /// length-check before calling this.
    pub fn from_slice(slice: &[u8]) -> Self {
        Self(B256::from_slice(slice))
    }

    /// Returns the address bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Returns the address bytes as a fixed array reference.
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0 .0
    }

    /// Copies the address into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Whether this is the all-zero address.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Proximity order to `other`: the number of matching leading bits,
    /// capped at [`MAX_PO`].
    pub fn proximity(&self, other: &Self) -> u8 {
        proximity_impl(self, other, MAX_PO)
    }

    /// Uncapped-by-routing proximity, used for prefix balancing.
    pub fn extended_proximity(&self, other: &Self) -> u8 {
        proximity_impl(self, other, EXTENDED_PO)
    }

    /// Returns true if `self` is strictly closer to `target` than `other`.
    pub fn closer(&self, target: &Self, other: &Self) -> bool {
        distance_cmp(target, self, other) == Ordering::Greater
    }

    /// Returns the bit at position `i`, most significant first.
    pub fn bit(&self, i: usize) -> bool {
        self.0[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// Sets the bit at position `i`, most significant first.
    pub fn set_bit(&mut self, i: usize, value: bool) {
        let mask = 0x80 >> (i % 8);
        if value {
            self.0[i / 8] |= mask;
        } else {
            self.0[i / 8] &= !mask;
        }
    }
}

// Counts common leading bits of the MSB-first XOR of the two addresses.
//
// Proximity is the discrete logarithmic scaling of the XOR distance: the
// reverse rank of the integer part of the base-2 logarithm of x ^ y.
fn proximity_impl(one: &SwarmAddress, other: &SwarmAddress, max_po: u8) -> u8 {
    let b = (max_po as usize / 8 + 1).min(HASH_SIZE);
    for i in 0..b {
        let oxo = one.0[i] ^ other.0[i];
        for j in 0..8 {
            if (oxo >> (7 - j)) & 0x01 != 0 {
                let po = (i * 8 + j) as u8;
                return po.min(max_po);
            }
        }
    }
    max_po
}

/// Returns the XOR distance between `x` and `y` as a big-endian integer.
pub fn distance(x: &SwarmAddress, y: &SwarmAddress) -> U256 {
    let mut xor = [0u8; HASH_SIZE];
    for (i, b) in xor.iter_mut().enumerate() {
        *b = x.0[i] ^ y.0[i];
    }
    U256::from_be_bytes(xor)
}

/// Compares `x` and `y` by distance to `target`. It returns:
///   - `Ordering::Greater` if `x` is closer to `target` than `y`
///   - `Ordering::Equal` if `x` and `y` are equidistant from `target`
///     (which means `x` and `y` are the same address)
///   - `Ordering::Less` if `x` is farther from `target` than `y`
pub fn distance_cmp(target: &SwarmAddress, x: &SwarmAddress, y: &SwarmAddress) -> Ordering {
    for i in 0..HASH_SIZE {
        let dx = x.0[i] ^ target.0[i];
        let dy = y.0[i] ^ target.0[i];
        if dx != dy {
            return if dx < dy { Ordering::Greater } else { Ordering::Less };
        }
    }
    Ordering::Equal
}

/// Draws a random address that agrees with `base` in exactly `po` leading
/// bits and differs at bit `po`.
pub fn neighbour_at(base: &SwarmAddress, po: u8) -> SwarmAddress {
    let mut addr = SwarmAddress(B256::random());
    for i in 0..po as usize {
        let b = base.bit(i);
        addr.set_bit(i, b);
    }
    addr.set_bit(po as usize, !base.bit(po as usize));
    addr
}

impl fmt::Display for SwarmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SwarmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwarmAddress({})", self.0)
    }
}

impl FromStr for SwarmAddress {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(B256::from_str(s)?))
    }
}

impl From<[u8; HASH_SIZE]> for SwarmAddress {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(B256::from(bytes))
    }
}

impl From<B256> for SwarmAddress {
    fn from(inner: B256) -> Self {
        Self(inner)
    }
}

impl From<SwarmAddress> for B256 {
    fn from(addr: SwarmAddress) -> Self {
        addr.0
    }
}

impl AsRef<[u8]> for SwarmAddress {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> arbitrary::Arbitrary<'a> for SwarmAddress {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::new(u.arbitrary()?))
    }
}
