//! The address book: the persistent overlay→underlay mapping.
//!
//! Entries are signed peer records; `put` re-verifies the signature so a
//! record that made it into the book is always attributable to the key its
//! overlay was derived from.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;
use voyager_primitives::{NodeRecord, SwarmAddress};
use voyager_statestore::{keys, StateStore, StateStoreError, StateStoreExt};

/// Errors surfaced by the address book.
#[derive(Debug, Error)]
pub enum AddressBookError {
    /// No record for the overlay.
    #[error("entry not found")]
    NotFound,
    /// The record failed signature verification.
    #[error("invalid address")]
    InvalidAddress,
    /// Underlying state-store failure.
    #[error(transparent)]
    Store(StateStoreError),
}

impl From<StateStoreError> for AddressBookError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::NotFound => AddressBookError::NotFound,
            other => AddressBookError::Store(other),
        }
    }
}

/// Persistent book of verified peer records, keyed by overlay address.
#[derive(Clone)]
pub struct AddressBook {
    store: Arc<dyn StateStore>,
    network_id: u64,
}

impl std::fmt::Debug for AddressBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressBook")
            .field("network_id", &self.network_id)
            .finish_non_exhaustive()
    }
}

fn entry_key(overlay: &SwarmAddress) -> String {
    format!("{}{overlay}", keys::ADDRESSBOOK_PREFIX)
}

impl AddressBook {
    /// Creates a book over the given state store.
    pub fn new(store: Arc<dyn StateStore>, network_id: u64) -> Self {
        Self { store, network_id }
    }

    /// Verifies and stores a record under its overlay.
    pub fn put(
        &self,
        overlay: &SwarmAddress,
        record: &NodeRecord,
    ) -> Result<(), AddressBookError> {
        // Reject records that do not verify for this network or whose
        // claimed overlay disagrees with the key they are stored under.
        let verified = NodeRecord::parse(
            &record.underlay().to_vec(),
            record.overlay().as_slice(),
            &record.signature_bytes(),
            self.network_id,
        )
        .map_err(|_| AddressBookError::InvalidAddress)?;
        if verified.overlay() != overlay {
            return Err(AddressBookError::InvalidAddress);
        }

        trace!(%overlay, underlay = %record.underlay(), "addressbook put");
        self.store.put(&entry_key(overlay), record)?;
        Ok(())
    }

    /// Returns the record stored under `overlay`.
    pub fn get(&self, overlay: &SwarmAddress) -> Result<NodeRecord, AddressBookError> {
        Ok(self.store.get(&entry_key(overlay))?)
    }

    /// Removes the record stored under `overlay`.
    pub fn remove(&self, overlay: &SwarmAddress) -> Result<(), AddressBookError> {
        self.store.delete(&entry_key(overlay))?;
        Ok(())
    }

    /// All overlays with a stored record.
    pub fn overlays(&self) -> Result<Vec<SwarmAddress>, AddressBookError> {
        Ok(self.records()?.into_iter().map(|r| *r.overlay()).collect())
    }

    /// All stored records.
    pub fn records(&self) -> Result<Vec<NodeRecord>, AddressBookError> {
        let mut records = Vec::new();
        self.store
            .iterate(keys::ADDRESSBOOK_PREFIX, &mut |_, value| {
                let record: NodeRecord =
                    serde_json::from_slice(value).map_err(StateStoreError::Serde)?;
                records.push(record);
                Ok(false)
            })?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use alloy_signer_local::PrivateKeySigner;
    use libp2p::Multiaddr;
    use voyager_statestore::MemStateStore;

    use super::*;

    const NETWORK_ID: u64 = 1;

    fn record(port: u16) -> NodeRecord {
        let signer = PrivateKeySigner::random();
        let underlay: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap();
        NodeRecord::new(&signer, underlay, NETWORK_ID).unwrap()
    }

    fn book() -> AddressBook {
        AddressBook::new(Arc::new(MemStateStore::new()), NETWORK_ID)
    }

    #[test]
    fn put_get_roundtrip() {
        let book = book();
        let record = record(1634);
        book.put(record.overlay(), &record).unwrap();
        assert_eq!(book.get(record.overlay()).unwrap(), record);
    }

    #[test]
    fn get_missing_is_not_found() {
        let book = book();
        let overlay = SwarmAddress::new([1; 32]);
        assert!(matches!(book.get(&overlay), Err(AddressBookError::NotFound)));
    }

    #[test]
    fn put_rejects_mismatched_overlay() {
        let book = book();
        let record = record(1634);
        let foreign = SwarmAddress::new([9; 32]);
        assert!(matches!(
            book.put(&foreign, &record),
            Err(AddressBookError::InvalidAddress)
        ));
    }

    #[test]
    fn put_rejects_wrong_network() {
        let signer = PrivateKeySigner::random();
        let underlay: Multiaddr = "/ip4/127.0.0.1/tcp/1634".parse().unwrap();
        let record = NodeRecord::new(&signer, underlay, 2).unwrap();

        let book = book();
        assert!(matches!(
            book.put(record.overlay(), &record),
            Err(AddressBookError::InvalidAddress)
        ));
    }

    #[test]
    fn overlays_and_records_list_everything() {
        let book = book();
        let a = record(1);
        let b = record(2);
        book.put(a.overlay(), &a).unwrap();
        book.put(b.overlay(), &b).unwrap();

        let overlays = book.overlays().unwrap();
        assert_eq!(overlays.len(), 2);
        assert!(overlays.contains(a.overlay()));
        assert!(overlays.contains(b.overlay()));
        assert_eq!(book.records().unwrap().len(), 2);
    }

    #[test]
    fn remove_forgets_entry() {
        let book = book();
        let record = record(1634);
        book.put(record.overlay(), &record).unwrap();
        book.remove(record.overlay()).unwrap();
        assert!(matches!(
            book.get(record.overlay()),
            Err(AddressBookError::NotFound)
        ));
    }
}
