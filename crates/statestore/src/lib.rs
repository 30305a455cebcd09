//! State persistence for node-level bookkeeping.
//!
//! The embedded database itself lives behind the [`StateStore`] trait: an
//! ordered byte-key store with prefix iteration. Values are JSON, so
//! anything serde-serializable can be persisted. The crate ships an
//! in-memory ordered implementation used in tests and single-process nodes.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;
use voyager_primitives::SwarmAddress;

/// Well-known state keys.
pub mod keys {
    /// The node's own overlay address, written on first boot.
    pub const OVERLAY: &str = "overlay";
    /// Prefix of address-book entries.
    pub const ADDRESSBOOK_PREFIX: &str = "addressbook:";
    /// Prefix of persisted tags.
    pub const TAGS_PREFIX: &str = "tags:";
    /// Reserved for settlement bootstrap.
    pub const CHEQUEBOOK: &str = "swap_chequebook";
    /// Reserved for settlement bootstrap.
    pub const CHEQUEBOOK_DEPLOYMENT: &str = "swap_chequebook_transaction_deployment";
}

/// Errors surfaced by state stores.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// No value under the key.
    #[error("entry not found")]
    NotFound,
    /// Value (de)serialization failed.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    /// Underlying store failure.
    #[error("store: {0}")]
    Store(String),
    /// The persisted overlay disagrees with the configured identity.
    #[error("overlay mismatch: stored {stored}, configured {configured}")]
    OverlayMismatch {
        stored: SwarmAddress,
        configured: SwarmAddress,
    },
}

/// Ordered key/value store with prefix iteration.
///
/// Implementations must provide atomic single-key operations; batch
/// atomicity is an implementation concern of the embedded database and is
/// not relied upon here.
pub trait StateStore: Send + Sync + 'static {
    /// Returns the raw value under `key`, if present.
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StateStoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), StateStoreError>;

    /// Removes the value under `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StateStoreError>;

    /// Calls `f` for every entry whose key starts with `prefix`, in key
    /// order, until `f` returns `true` (stop) or entries run out.
    fn iterate(
        &self,
        prefix: &str,
        f: &mut dyn FnMut(&str, &[u8]) -> Result<bool, StateStoreError>,
    ) -> Result<(), StateStoreError>;
}

/// Typed accessors over any [`StateStore`].
pub trait StateStoreExt: StateStore {
    /// Returns the JSON-decoded value under `key`.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateStoreError> {
        let raw = self.get_raw(key)?.ok_or(StateStoreError::NotFound)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// JSON-encodes and stores `value` under `key`.
    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateStoreError> {
        self.put_raw(key, serde_json::to_vec(value)?)
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// In-memory ordered state store.
#[derive(Debug, Default)]
pub struct MemStateStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StateStore for MemStateStore {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StateStoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), StateStoreError> {
        self.entries.write().insert(key.to_owned(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StateStoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn iterate(
        &self,
        prefix: &str,
        f: &mut dyn FnMut(&str, &[u8]) -> Result<bool, StateStoreError>,
    ) -> Result<(), StateStoreError> {
        // Collect under the lock, call back outside of it: callbacks are
        // allowed to re-enter the store.
        let entries: Vec<(String, Vec<u8>)> = self
            .entries
            .read()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            if f(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

/// Verifies the persisted overlay against the configured one.
///
/// The first boot writes the overlay; later boots fail when the configured
/// key would change the node's identity under an existing data directory.
pub fn check_overlay<S: StateStore + ?Sized>(
    store: &S,
    configured: &SwarmAddress,
) -> Result<(), StateStoreError> {
    match store.get::<SwarmAddress>(keys::OVERLAY) {
        Ok(stored) => {
            if &stored != configured {
                return Err(StateStoreError::OverlayMismatch {
                    stored,
                    configured: *configured,
                });
            }
            Ok(())
        }
        Err(StateStoreError::NotFound) => {
            debug!(overlay = %configured, "storing new overlay");
            store.put(keys::OVERLAY, configured)
        }
        Err(err) => Err(err),
    }
}
