use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};
use voyager_primitives::{AnyChunk, SwarmAddress};

use crate::{ModeGet, ModePut, ModeSet, StorageError, Storer};

/// Hard limit of a pinned-chunk listing page.
const MAX_PAGE: usize = 1000;

/// Configuration of the local store.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Number of chunks the store holds before garbage collection starts.
    pub capacity: usize,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self { capacity: 1_000_000 }
    }
}

/// A pinned chunk and its pin counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedChunk {
    /// The chunk address.
    pub address: SwarmAddress,
    /// The number of active pins.
    pub pin_counter: u64,
}

#[derive(Debug)]
struct Entry {
    chunk: AnyChunk,
    /// Logical access timestamp; drives the eviction order.
    access: u64,
    /// Logical store timestamp; drives the push-queue order.
    stored: u64,
    pin: u64,
    /// Synced or cache chunks may be collected; unsynced uploads may not.
    gc_eligible: bool,
    push_pending: bool,
}

#[derive(Debug, Default)]
struct Indexes {
    entries: HashMap<SwarmAddress, Entry>,
    /// `(access, address)` of every collectable chunk, oldest first.
    gc: BTreeSet<(u64, SwarmAddress)>,
    /// `(stored, address)` of chunks awaiting push propagation.
    push: BTreeSet<(u64, SwarmAddress)>,
    clock: u64,
}

impl Indexes {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn gc_insert(&mut self, address: SwarmAddress) {
        if let Some(entry) = self.entries.get(&address) {
            if entry.pin == 0 && entry.gc_eligible {
                self.gc.insert((entry.access, address));
            }
        }
    }

    fn gc_remove(&mut self, address: &SwarmAddress) {
        if let Some(entry) = self.entries.get(address) {
            self.gc.remove(&(entry.access, *address));
        }
    }
}

/// In-memory chunk store with mode-driven index maintenance.
///
/// The retrieval, push, pin and GC indexes mirror the layout a disk-backed
/// store would keep under separate key prefixes; here they are plain ordered
/// sets guarded by one lock, which keeps every mode transition atomic.
#[derive(Debug)]
pub struct LocalStore {
    indexes: RwLock<Indexes>,
    config: LocalStoreConfig,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(LocalStoreConfig::default())
    }
}

impl LocalStore {
    /// Creates an empty store.
    pub fn new(config: LocalStoreConfig) -> Self {
        Self {
            indexes: RwLock::new(Indexes::default()),
            config,
        }
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.indexes.read().entries.len()
    }

    /// Whether the store holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.indexes.read().entries.is_empty()
    }

    /// The pin counter of a chunk.
    pub fn pin_counter(&self, address: &SwarmAddress) -> Result<u64, StorageError> {
        let indexes = self.indexes.read();
        match indexes.entries.get(address) {
            Some(entry) if entry.pin > 0 => Ok(entry.pin),
            _ => Err(StorageError::NotFound),
        }
    }

    /// Lists pinned chunks in address order, `limit` capped at 1000.
    pub fn pinned_chunks(&self, offset: usize, limit: usize) -> Vec<PinnedChunk> {
        let limit = limit.min(MAX_PAGE);
        let indexes = self.indexes.read();
        let mut pinned: Vec<PinnedChunk> = indexes
            .entries
            .iter()
            .filter(|(_, e)| e.pin > 0)
            .map(|(address, e)| PinnedChunk {
                address: *address,
                pin_counter: e.pin,
            })
            .collect();
        pinned.sort_by_key(|p| p.address);
        pinned.into_iter().skip(offset).take(limit).collect()
    }

    /// Addresses awaiting push propagation, oldest stored first.
    pub fn pending_push(&self) -> Vec<SwarmAddress> {
        self.indexes
            .read()
            .push
            .iter()
            .map(|(_, address)| *address)
            .collect()
    }

    /// Evicts collectable chunks, oldest access first, until the store is at
    /// its post-collection target. Returns the number of evicted chunks.
    pub fn collect_garbage(&self) -> usize {
        let target = self.config.capacity - self.config.capacity / 10;
        let mut indexes = self.indexes.write();
        let mut evicted = 0;
        while indexes.entries.len() > target {
            let Some(&(access, address)) = indexes.gc.iter().next() else {
                break;
            };
            indexes.gc.remove(&(access, address));
            if let Some(entry) = indexes.entries.remove(&address) {
                indexes.push.remove(&(entry.stored, address));
                evicted += 1;
                trace!(%address, "gc evicted chunk");
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = indexes.entries.len(), "gc pass done");
        }
        evicted
    }

    fn put_one(&self, indexes: &mut Indexes, mode: ModePut, chunk: &AnyChunk) -> bool {
        let address = chunk.address();
        let now = indexes.tick();

        if indexes.entries.contains_key(&address) {
            if mode == ModePut::UploadPin {
                self.pin_locked(indexes, &address);
            }
            return true;
        }

        let (gc_eligible, push_pending, pin) = match mode {
            ModePut::Upload => (false, true, 0),
            ModePut::UploadPin => (false, true, 1),
            ModePut::Request => (true, false, 0),
            ModePut::Sync => (true, false, 0),
        };

        indexes.entries.insert(
            address,
            Entry {
                chunk: chunk.clone(),
                access: now,
                stored: now,
                pin,
                gc_eligible,
                push_pending,
            },
        );
        if push_pending {
            indexes.push.insert((now, address));
        }
        indexes.gc_insert(address);
        false
    }

    fn pin_locked(&self, indexes: &mut Indexes, address: &SwarmAddress) {
        indexes.gc_remove(address);
        if let Some(entry) = indexes.entries.get_mut(address) {
            entry.pin += 1;
        }
    }
}

#[async_trait]
impl Storer for LocalStore {
    async fn get(
        &self,
        mode: ModeGet,
        address: &SwarmAddress,
    ) -> Result<AnyChunk, StorageError> {
        let mut indexes = self.indexes.write();
        let now = indexes.tick();
        let entry = indexes
            .entries
            .get(address)
            .ok_or(StorageError::NotFound)?;
        let chunk = entry.chunk.clone();

        if mode == ModeGet::Request {
            // Refresh the eviction position under the same lock.
            indexes.gc_remove(address);
            if let Some(entry) = indexes.entries.get_mut(address) {
                entry.access = now;
            }
            indexes.gc_insert(*address);
        }
        Ok(chunk)
    }

    async fn put(&self, mode: ModePut, chunks: &[AnyChunk]) -> Result<Vec<bool>, StorageError> {
        let seen = {
            let mut indexes = self.indexes.write();
            chunks
                .iter()
                .map(|chunk| self.put_one(&mut indexes, mode, chunk))
                .collect()
        };
        if self.len() > self.config.capacity {
            self.collect_garbage();
        }
        Ok(seen)
    }

    async fn has(&self, address: &SwarmAddress) -> Result<bool, StorageError> {
        Ok(self.indexes.read().entries.contains_key(address))
    }

    async fn set(&self, mode: ModeSet, addresses: &[SwarmAddress]) -> Result<(), StorageError> {
        let mut indexes = self.indexes.write();
        for address in addresses {
            if !indexes.entries.contains_key(address) {
                return Err(StorageError::NotFound);
            }
            match mode {
                ModeSet::Sync => {
                    indexes.gc_remove(address);
                    let entry = indexes.entries.get_mut(address).expect("checked above");
                    if entry.push_pending {
                        let stored = entry.stored;
                        entry.push_pending = false;
                        indexes.push.remove(&(stored, *address));
                    }
                    let entry = indexes.entries.get_mut(address).expect("checked above");
                    entry.gc_eligible = true;
                    indexes.gc_insert(*address);
                }
                ModeSet::Remove => {
                    indexes.gc_remove(address);
                    if let Some(entry) = indexes.entries.remove(address) {
                        indexes.push.remove(&(entry.stored, *address));
                    }
                }
                ModeSet::Pin => {
                    self.pin_locked(&mut indexes, address);
                }
                ModeSet::Unpin => {
                    let entry = indexes.entries.get_mut(address).expect("checked above");
                    if entry.pin == 0 {
                        return Err(StorageError::NotFound);
                    }
                    entry.pin -= 1;
                    if entry.pin == 0 {
                        indexes.gc_insert(*address);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use voyager_primitives::ContentChunk;

    use super::*;

    fn chunk(n: u8) -> AnyChunk {
        ContentChunk::new(format!("chunk data {n}").into_bytes())
            .unwrap()
            .into()
    }

    fn store() -> LocalStore {
        LocalStore::new(LocalStoreConfig { capacity: 100 })
    }

    #[tokio::test]
    async fn upload_then_request_roundtrip() {
        let store = store();
        let ch = chunk(1);
        store.put(ModePut::Upload, &[ch.clone()]).await.unwrap();
        let got = store.get(ModeGet::Request, &ch.address()).await.unwrap();
        assert_eq!(got, ch);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = store();
        let err = store
            .get(ModeGet::Lookup, &SwarmAddress::new([9; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn put_reports_seen() {
        let store = store();
        let a = chunk(1);
        let b = chunk(2);
        let seen = store
            .put(ModePut::Upload, &[a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(seen, vec![false, false]);

        let seen = store.put(ModePut::Upload, &[a, chunk(3)]).await.unwrap();
        assert_eq!(seen, vec![true, false]);
    }

    #[tokio::test]
    async fn upload_queues_push_and_sync_drains_it() {
        let store = store();
        let a = chunk(1);
        let b = chunk(2);
        store.put(ModePut::Upload, &[a.clone()]).await.unwrap();
        store.put(ModePut::Sync, &[b.clone()]).await.unwrap();

        assert_eq!(store.pending_push(), vec![a.address()]);

        store.set(ModeSet::Sync, &[a.address()]).await.unwrap();
        assert!(store.pending_push().is_empty());
    }

    #[tokio::test]
    async fn pinned_chunk_survives_gc() {
        let store = LocalStore::new(LocalStoreConfig { capacity: 10 });
        let pinned = chunk(0);
        store
            .put(ModePut::UploadPin, &[pinned.clone()])
            .await
            .unwrap();
        store.set(ModeSet::Sync, &[pinned.address()]).await.unwrap();

        for n in 1..=20 {
            store.put(ModePut::Request, &[chunk(n)]).await.unwrap();
        }

        assert!(store.len() <= 10);
        assert!(store.has(&pinned.address()).await.unwrap());
        assert_eq!(store.pin_counter(&pinned.address()).unwrap(), 1);
    }

    #[tokio::test]
    async fn gc_evicts_oldest_access_first() {
        let store = LocalStore::new(LocalStoreConfig { capacity: 10 });
        let chunks: Vec<AnyChunk> = (0..10).map(chunk).collect();
        store.put(ModePut::Request, &chunks).await.unwrap();

        // Touch the first chunk so it becomes the most recently used.
        store
            .get(ModeGet::Request, &chunks[0].address())
            .await
            .unwrap();

        store.put(ModePut::Request, &[chunk(10)]).await.unwrap();
        assert!(store.has(&chunks[0].address()).await.unwrap());
        // The least recently used chunk is gone.
        assert!(!store.has(&chunks[1].address()).await.unwrap());
    }

    #[tokio::test]
    async fn lookup_does_not_refresh_eviction_order() {
        let store = LocalStore::new(LocalStoreConfig { capacity: 10 });
        let chunks: Vec<AnyChunk> = (0..10).map(chunk).collect();
        store.put(ModePut::Request, &chunks).await.unwrap();

        store
            .get(ModeGet::Lookup, &chunks[0].address())
            .await
            .unwrap();

        store.put(ModePut::Request, &[chunk(10)]).await.unwrap();
        // The lookup did not protect the oldest chunk.
        assert!(!store.has(&chunks[0].address()).await.unwrap());
    }

    #[tokio::test]
    async fn unsynced_upload_is_not_collected() {
        let store = LocalStore::new(LocalStoreConfig { capacity: 10 });
        let upload = chunk(0);
        store.put(ModePut::Upload, &[upload.clone()]).await.unwrap();

        for n in 1..=20 {
            store.put(ModePut::Request, &[chunk(n)]).await.unwrap();
        }
        assert!(store.has(&upload.address()).await.unwrap());
    }

    #[tokio::test]
    async fn pin_unpin_lifecycle() {
        let store = store();
        let ch = chunk(1);
        store.put(ModePut::Request, &[ch.clone()]).await.unwrap();
        let address = ch.address();

        store.set(ModeSet::Pin, &[address]).await.unwrap();
        store.set(ModeSet::Pin, &[address]).await.unwrap();
        assert_eq!(store.pin_counter(&address).unwrap(), 2);

        store.set(ModeSet::Unpin, &[address]).await.unwrap();
        assert_eq!(store.pin_counter(&address).unwrap(), 1);

        store.set(ModeSet::Unpin, &[address]).await.unwrap();
        assert!(matches!(
            store.pin_counter(&address),
            Err(StorageError::NotFound)
        ));

        // A further unpin is an error.
        let err = store.set(ModeSet::Unpin, &[address]).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn remove_drops_all_state() {
        let store = store();
        let ch = chunk(1);
        store.put(ModePut::UploadPin, &[ch.clone()]).await.unwrap();
        store.set(ModeSet::Remove, &[ch.address()]).await.unwrap();

        assert!(!store.has(&ch.address()).await.unwrap());
        assert!(store.pending_push().is_empty());
        assert!(store.pinned_chunks(0, 10).is_empty());
    }

    #[tokio::test]
    async fn pinned_chunks_paginate() {
        let store = store();
        let chunks: Vec<AnyChunk> = (0..5).map(chunk).collect();
        store.put(ModePut::UploadPin, &chunks).await.unwrap();

        let page = store.pinned_chunks(0, 3);
        assert_eq!(page.len(), 3);
        let rest = store.pinned_chunks(3, 3);
        assert_eq!(rest.len(), 2);

        let mut all: Vec<_> = page.into_iter().chain(rest).map(|p| p.address).collect();
        let mut expected: Vec<_> = chunks.iter().map(|c| c.address()).collect();
        all.sort();
        expected.sort();
        assert_eq!(all, expected);
    }
}
