//! The netstore: the local store extended over the network.
//!
//! A get that misses locally is resolved through the retrieval protocol
//! and cached back with request semantics, so the next read is local. When
//! even the network fails and the caller supplied recovery targets, a
//! registered recovery callback is scheduled once and the caller gets a
//! sentinel distinct from a plain miss.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};
use voyager_localstore::{ModeGet, ModePut, ModeSet, StorageError, Storer};
use voyager_primitives::{AnyChunk, SwarmAddress};
use voyager_retrieval::{RetrievalError, Retriever};

/// Prefix targets a recovery callback may use to locate lost content.
pub type RecoveryTargets = Vec<Bytes>;

/// Invoked off-path when a chunk is lost and the request asked for recovery.
pub type RecoveryCallback = Arc<dyn Fn(SwarmAddress, RecoveryTargets) + Send + Sync>;

/// Local store + on-miss retrieval + optional recovery.
pub struct NetStore {
    local: Arc<dyn Storer>,
    retrieval: Arc<dyn Retriever>,
    recovery: Option<RecoveryCallback>,
}

impl std::fmt::Debug for NetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStore")
            .field("recovery", &self.recovery.is_some())
            .finish_non_exhaustive()
    }
}

impl NetStore {
    /// Wraps a local store with retrieval.
    pub fn new(
        local: Arc<dyn Storer>,
        retrieval: Arc<dyn Retriever>,
        recovery: Option<RecoveryCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            retrieval,
            recovery,
        })
    }

    /// A get whose request context carries recovery targets.
    ///
    /// Behaves like [`Storer::get`], except that a full miss with targets
    /// and a registered callback schedules the callback asynchronously and
    /// reports [`StorageError::RecoveryAttempt`].
    pub async fn get_with_recovery(
        &self,
        mode: ModeGet,
        address: &SwarmAddress,
        targets: Option<&RecoveryTargets>,
    ) -> Result<AnyChunk, StorageError> {
        match self.local.get(mode, address).await {
            Ok(chunk) => return Ok(chunk),
            Err(StorageError::NotFound) => {}
            Err(err) => return Err(err),
        }

        trace!(%address, "local miss, retrieving from the network");
        match self.retrieval.retrieve_chunk(address).await {
            Ok(chunk) => {
                self.local.put(ModePut::Request, &[chunk.clone()]).await?;
                Ok(chunk)
            }
            Err(err) => match (targets, &self.recovery) {
                (Some(targets), Some(callback)) => {
                    debug!(%address, "retrieval failed, initiating recovery");
                    let callback = Arc::clone(callback);
                    let address = *address;
                    let targets = targets.clone();
                    let _ = tokio::spawn(async move {
                        callback(address, targets);
                    });
                    Err(StorageError::RecoveryAttempt)
                }
                _ => Err(retrieval_to_storage(err)),
            },
        }
    }
}

fn retrieval_to_storage(err: RetrievalError) -> StorageError {
    match err {
        RetrievalError::ChunkNotFound => StorageError::ChunkNotFound,
        other => StorageError::Store(other.to_string()),
    }
}

#[async_trait]
impl Storer for NetStore {
    async fn get(&self, mode: ModeGet, address: &SwarmAddress) -> Result<AnyChunk, StorageError> {
        self.get_with_recovery(mode, address, None).await
    }

    async fn put(&self, mode: ModePut, chunks: &[AnyChunk]) -> Result<Vec<bool>, StorageError> {
        self.local.put(mode, chunks).await
    }

    async fn has(&self, address: &SwarmAddress) -> Result<bool, StorageError> {
        self.local.has(address).await
    }

    async fn set(&self, mode: ModeSet, addresses: &[SwarmAddress]) -> Result<(), StorageError> {
        self.local.set(mode, addresses).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use voyager_localstore::LocalStore;
    use voyager_primitives::ContentChunk;

    use super::*;

    /// A retriever with a fixed inventory and a call counter.
    #[derive(Debug, Default)]
    struct FixedRetriever {
        chunks: Mutex<Vec<AnyChunk>>,
        calls: AtomicUsize,
    }

    impl FixedRetriever {
        fn with_chunk(chunk: AnyChunk) -> Self {
            Self {
                chunks: Mutex::new(vec![chunk]),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve_chunk(
            &self,
            address: &SwarmAddress,
        ) -> Result<AnyChunk, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.chunks
                .lock()
                .iter()
                .find(|c| c.address() == *address)
                .cloned()
                .ok_or(RetrievalError::ChunkNotFound)
        }
    }

    fn chunk() -> AnyChunk {
        ContentChunk::new(b"netstore payload".to_vec()).unwrap().into()
    }

    #[tokio::test]
    async fn miss_retrieves_then_serves_locally() {
        let chunk = chunk();
        let address = chunk.address();
        let local: Arc<LocalStore> = Arc::new(LocalStore::default());
        let retriever = Arc::new(FixedRetriever::with_chunk(chunk.clone()));
        let store = NetStore::new(local.clone(), retriever.clone(), None);

        let got = store.get(ModeGet::Request, &address).await.unwrap();
        assert_eq!(got, chunk);
        assert_eq!(retriever.calls(), 1);

        // The second read is served from the local cache.
        let got = store.get(ModeGet::Request, &address).await.unwrap();
        assert_eq!(got, chunk);
        assert_eq!(retriever.calls(), 1);
        assert!(local.has(&address).await.unwrap());
    }

    #[tokio::test]
    async fn local_hit_never_touches_the_network() {
        let chunk = chunk();
        let address = chunk.address();
        let local: Arc<LocalStore> = Arc::new(LocalStore::default());
        let retriever = Arc::new(FixedRetriever::default());
        let store = NetStore::new(local.clone(), retriever.clone(), None);

        store.put(ModePut::Upload, &[chunk.clone()]).await.unwrap();
        let got = store.get(ModeGet::Request, &address).await.unwrap();
        assert_eq!(got, chunk);
        assert_eq!(retriever.calls(), 0);
    }

    #[tokio::test]
    async fn full_miss_without_recovery_is_not_found() {
        let local: Arc<LocalStore> = Arc::new(LocalStore::default());
        let retriever = Arc::new(FixedRetriever::default());
        let store = NetStore::new(local, retriever, None);

        let err = store
            .get(ModeGet::Request, &SwarmAddress::new([7; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChunkNotFound));
    }

    #[tokio::test]
    async fn full_miss_with_targets_schedules_recovery_once() {
        let local: Arc<LocalStore> = Arc::new(LocalStore::default());
        let retriever = Arc::new(FixedRetriever::default());

        let invocations: Arc<Mutex<Vec<(SwarmAddress, RecoveryTargets)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&invocations);
        let callback: RecoveryCallback =
            Arc::new(move |address, targets| sink.lock().push((address, targets)));
        let store = NetStore::new(local, retriever, Some(callback));

        let address = SwarmAddress::new([7; 32]);
        let targets: RecoveryTargets = vec![Bytes::from_static(b"\x12\x34")];
        let err = store
            .get_with_recovery(ModeGet::Request, &address, Some(&targets))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RecoveryAttempt));

        // The callback runs on a detached task, exactly once.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        let invocations = invocations.lock();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0], (address, targets));
    }

    #[tokio::test]
    async fn recovery_needs_targets() {
        let local: Arc<LocalStore> = Arc::new(LocalStore::default());
        let retriever = Arc::new(FixedRetriever::default());
        let callback: RecoveryCallback = Arc::new(|_, _| panic!("must not be invoked"));
        let store = NetStore::new(local, retriever, Some(callback));

        let err = store
            .get(ModeGet::Request, &SwarmAddress::new([7; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChunkNotFound));
    }
}
