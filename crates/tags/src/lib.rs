//! Upload tags: progress counters for a single upload.
//!
//! A tag counts the chunks of one upload through its pipeline states:
//! split off the byte stream, stored locally, seen before, sent to the
//! network, and acknowledged synced. Counters are atomic; increments of
//! different counters are not ordered against each other. Tags persist
//! through the state store under `tags:<uid>` keys.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;
use voyager_primitives::SwarmAddress;
use voyager_statestore::{keys, StateStore, StateStoreError, StateStoreExt};

/// Hard cap of a tag listing page.
const MAX_PAGE: usize = 1000;

/// Errors surfaced by the tag registry.
#[derive(Debug, Error)]
pub enum TagsError {
    /// No tag with the uid.
    #[error("tag not found")]
    NotFound,
    /// State-store failure.
    #[error(transparent)]
    Store(#[from] StateStoreError),
}

/// A chunk's pipeline state, as counted by a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagState {
    /// Chunk split off the input stream.
    Split,
    /// Chunk stored locally.
    Stored,
    /// Chunk was already present when stored.
    Seen,
    /// Chunk handed to the network.
    Sent,
    /// Chunk acknowledged by a receipt.
    Synced,
}

/// Counter bundle of one upload.
#[derive(Debug)]
pub struct Tag {
    uid: u32,
    split: AtomicU64,
    stored: AtomicU64,
    seen: AtomicU64,
    sent: AtomicU64,
    synced: AtomicU64,
    total: AtomicU64,
    address: RwLock<SwarmAddress>,
}

impl Tag {
    fn new(uid: u32) -> Self {
        Self {
            uid,
            split: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            seen: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            total: AtomicU64::new(0),
            address: RwLock::new(SwarmAddress::ZERO),
        }
    }

    /// The tag's unique id.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Atomically increments one counter.
    pub fn inc(&self, state: TagState) {
        self.counter(state).fetch_add(1, Ordering::Relaxed);
    }

    /// The current value of one counter.
    pub fn get(&self, state: TagState) -> u64 {
        self.counter(state).load(Ordering::Relaxed)
    }

    /// The frozen chunk total, 0 until splitting is done.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// The upload's root address, zero until splitting is done.
    pub fn address(&self) -> SwarmAddress {
        *self.address.read()
    }

    /// Stamps the root address and freezes the total at the split count.
    pub fn done_split(&self, address: SwarmAddress) -> u64 {
        let total = self.get(TagState::Split);
        self.total.store(total, Ordering::Relaxed);
        *self.address.write() = address;
        trace!(uid = self.uid, %address, total, "split done");
        total
    }

    fn counter(&self, state: TagState) -> &AtomicU64 {
        match state {
            TagState::Split => &self.split,
            TagState::Stored => &self.stored,
            TagState::Seen => &self.seen,
            TagState::Sent => &self.sent,
            TagState::Synced => &self.synced,
        }
    }

    fn to_repr(&self) -> TagRepr {
        TagRepr {
            uid: self.uid,
            split: self.get(TagState::Split),
            stored: self.get(TagState::Stored),
            seen: self.get(TagState::Seen),
            sent: self.get(TagState::Sent),
            synced: self.get(TagState::Synced),
            total: self.total(),
            address: self.address(),
        }
    }

    fn from_repr(repr: TagRepr) -> Self {
        let tag = Self::new(repr.uid);
        tag.split.store(repr.split, Ordering::Relaxed);
        tag.stored.store(repr.stored, Ordering::Relaxed);
        tag.seen.store(repr.seen, Ordering::Relaxed);
        tag.sent.store(repr.sent, Ordering::Relaxed);
        tag.synced.store(repr.synced, Ordering::Relaxed);
        tag.total.store(repr.total, Ordering::Relaxed);
        *tag.address.write() = repr.address;
        tag
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TagRepr {
    uid: u32,
    split: u64,
    stored: u64,
    seen: u64,
    sent: u64,
    synced: u64,
    total: u64,
    address: SwarmAddress,
}

fn tag_key(uid: u32) -> String {
    // Big-endian hex keeps the state-store iteration in uid order.
    format!("{}{:08x}", keys::TAGS_PREFIX, uid)
}

/// Registry of live tags, backed by the state store.
pub struct Tags {
    store: Arc<dyn StateStore>,
    tags: RwLock<HashMap<u32, Arc<Tag>>>,
}

impl std::fmt::Debug for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tags")
            .field("live", &self.tags.read().len())
            .finish_non_exhaustive()
    }
}

impl Tags {
    /// Creates a registry, loading persisted tags from the store.
    pub fn new(store: Arc<dyn StateStore>) -> Result<Self, TagsError> {
        let mut tags = HashMap::new();
        store.iterate(keys::TAGS_PREFIX, &mut |_, value| {
            let repr: TagRepr = serde_json::from_slice(value).map_err(StateStoreError::Serde)?;
            tags.insert(repr.uid, Arc::new(Tag::from_repr(repr)));
            Ok(false)
        })?;
        Ok(Self {
            store,
            tags: RwLock::new(tags),
        })
    }

    /// Creates a fresh tag with a random uid and persists it.
    pub fn create(&self) -> Result<Arc<Tag>, TagsError> {
        let mut tags = self.tags.write();
        let uid = loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && !tags.contains_key(&candidate) {
                break candidate;
            }
        };
        let tag = Arc::new(Tag::new(uid));
        self.store.put(&tag_key(uid), &tag.to_repr())?;
        tags.insert(uid, Arc::clone(&tag));
        Ok(tag)
    }

    /// Returns the live tag with the uid.
    pub fn get(&self, uid: u32) -> Result<Arc<Tag>, TagsError> {
        self.tags
            .read()
            .get(&uid)
            .cloned()
            .ok_or(TagsError::NotFound)
    }

    /// Persists the tag's current counters.
    pub fn flush(&self, uid: u32) -> Result<(), TagsError> {
        let tag = self.get(uid)?;
        self.store.put(&tag_key(uid), &tag.to_repr())?;
        Ok(())
    }

    /// Deletes the tag from memory and the store.
    pub fn delete(&self, uid: u32) -> Result<(), TagsError> {
        self.tags
            .write()
            .remove(&uid)
            .ok_or(TagsError::NotFound)?;
        self.store.delete(&tag_key(uid))?;
        Ok(())
    }

    /// Lists tags in uid order. `limit` is capped at 1000.
    pub fn list(&self, offset: usize, limit: usize) -> Vec<Arc<Tag>> {
        let limit = limit.min(MAX_PAGE);
        let tags = self.tags.read();
        let mut all: Vec<&Arc<Tag>> = tags.values().collect();
        all.sort_by_key(|t| t.uid);
        all.into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}
