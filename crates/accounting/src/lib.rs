//! Per-peer bandwidth accounting.
//!
//! Forwarding work is metered in abstract accounting units. Every hop of a
//! data protocol credits the peer that did work for us and debits the peer
//! we did work for; settlement of the resulting balances is out of scope
//! here and happens behind the [`Accounting`] seam.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;
use voyager_primitives::{SwarmAddress, MAX_PO};

/// Default base price of a chunk transfer in accounting units.
pub const DEFAULT_BASE_PRICE: u64 = 10_000;

/// Default disconnect threshold: the absolute balance at which a peer has
/// exhausted its credit.
pub const DEFAULT_PAYMENT_THRESHOLD: u64 = 10_000_000;

/// Errors surfaced by accounting.
#[derive(Debug, Error)]
pub enum AccountingError {
    /// The peer's debt would exceed the configured threshold.
    #[error("disconnect threshold exceeded for peer {peer}")]
    ThresholdExceeded { peer: SwarmAddress },
}

/// Prices a chunk transfer.
pub trait Pricer: Send + Sync + 'static {
    /// The price of serving `chunk` irrespective of the peer.
    fn price(&self, chunk: &SwarmAddress) -> u64;

    /// The price of `peer` serving `chunk`, scaled by their proximity.
    fn peer_price(&self, peer: &SwarmAddress, chunk: &SwarmAddress) -> u64;
}

/// Proximity-scaled fixed pricing: `(MAX_PO - proximity + 1) * base_price`.
#[derive(Debug, Clone)]
pub struct FixedPricer {
    base_price: u64,
}

impl FixedPricer {
    /// Creates a pricer with the given base price.
    pub fn new(base_price: u64) -> Self {
        Self { base_price }
    }

    /// The configured base price.
    pub fn base_price(&self) -> u64 {
        self.base_price
    }
}

impl Default for FixedPricer {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PRICE)
    }
}

impl Pricer for FixedPricer {
    fn price(&self, _chunk: &SwarmAddress) -> u64 {
        self.base_price
    }

    fn peer_price(&self, peer: &SwarmAddress, chunk: &SwarmAddress) -> u64 {
        let factor = (MAX_PO as u64) - (peer.proximity(chunk) as u64) + 1;
        factor * self.base_price
    }
}

/// Tracks signed balances with each peer.
///
/// A negative balance means we owe the peer; positive means the peer owes
/// us. `credit` records work a peer did for us, `debit` work we did for a
/// peer.
pub trait Accounting: Send + Sync + 'static {
    /// Records that `peer` did `amount` units of work for us.
    fn credit(&self, peer: &SwarmAddress, amount: u64) -> Result<(), AccountingError>;

    /// Records that we did `amount` units of work for `peer`.
    fn debit(&self, peer: &SwarmAddress, amount: u64) -> Result<(), AccountingError>;

    /// The current signed balance with `peer`.
    fn balance(&self, peer: &SwarmAddress) -> i64;
}

/// In-process accounting over a balance map.
#[derive(Debug)]
pub struct BalanceAccounting {
    balances: RwLock<HashMap<SwarmAddress, i64>>,
    payment_threshold: u64,
}

impl BalanceAccounting {
    /// Creates accounting with the default threshold.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_PAYMENT_THRESHOLD)
    }

    /// Creates accounting with an explicit disconnect threshold.
    pub fn with_threshold(payment_threshold: u64) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            payment_threshold,
        }
    }
}

impl Default for BalanceAccounting {
    fn default() -> Self {
        Self::new()
    }
}

impl Accounting for BalanceAccounting {
    fn credit(&self, peer: &SwarmAddress, amount: u64) -> Result<(), AccountingError> {
        let mut balances = self.balances.write();
        let balance = balances.entry(*peer).or_default();
        let next = *balance - amount as i64;
        if next.unsigned_abs() > self.payment_threshold {
            return Err(AccountingError::ThresholdExceeded { peer: *peer });
        }
        *balance = next;
        trace!(%peer, amount, balance = next, "credit");
        Ok(())
    }

    fn debit(&self, peer: &SwarmAddress, amount: u64) -> Result<(), AccountingError> {
        let mut balances = self.balances.write();
        let balance = balances.entry(*peer).or_default();
        let next = *balance + amount as i64;
        if next.unsigned_abs() > self.payment_threshold {
            return Err(AccountingError::ThresholdExceeded { peer: *peer });
        }
        *balance = next;
        trace!(%peer, amount, balance = next, "debit");
        Ok(())
    }

    fn balance(&self, peer: &SwarmAddress) -> i64 {
        self.balances.read().get(peer).copied().unwrap_or(0)
    }
}
