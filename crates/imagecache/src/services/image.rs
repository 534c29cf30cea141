use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};

use super::coordinator::{FetchCoordinator, FetchWaiter, WaiterToken};
use crate::caching::{
    Cache, CacheKey, DiskCache, FetchError, FetchResult, MemoryCache, PruneStats, Weigher,
};
use crate::codec::ValueCodec;
use crate::config::Config;
use crate::download::Fetcher;

/// The entry point for looking up images.
///
/// Composes the in-memory tier, the file-system tier and the network behind two operations:
/// [`peek`](Self::peek) only consults the caches, while [`fetch`](Self::fetch) falls back to
/// downloading the resource. Downloaded values are written through to both tiers before they are
/// handed out. Concurrent fetches of the same resource share a single download.
///
/// The service is cheap to clone, and all clones share the same caches.
pub struct ImageService<V: Clone + Send + Sync + 'static> {
    memory: Arc<dyn Cache<V>>,
    disk: Arc<dyn Cache<V>>,
    coordinator: FetchCoordinator<V>,
    fetcher: Arc<dyn Fetcher>,
    codec: Arc<dyn ValueCodec<Value = V>>,
}

impl<V: Clone + Send + Sync + 'static> Clone for ImageService<V> {
    fn clone(&self) -> Self {
        Self {
            memory: Arc::clone(&self.memory),
            disk: Arc::clone(&self.disk),
            coordinator: self.coordinator.clone(),
            fetcher: Arc::clone(&self.fetcher),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> fmt::Debug for ImageService<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageService")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync + 'static> ImageService<V> {
    /// Creates the caches described by `config`.
    ///
    /// This opens (and creates, if necessary) the cache directory, so it may block.
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn Fetcher>,
        codec: Arc<dyn ValueCodec<Value = V>>,
    ) -> io::Result<Self> {
        let weigher: Weigher<V> = {
            let codec = Arc::clone(&codec);
            Arc::new(move |value| codec.weight(value))
        };
        let memory = MemoryCache::new(&config.caches.memory, weigher);

        let location = config.storage_location();
        let disk = DiskCache::from_location(&*location, &config.caches.disk, Arc::clone(&codec))?;
        tracing::info!(cache_dir = %disk.cache_dir().display(), "Opened image cache");

        Ok(Self::from_parts(
            Arc::new(memory),
            Arc::new(disk),
            fetcher,
            codec,
            config.max_concurrent_fetches,
        ))
    }

    /// Creates a service from already constructed tiers.
    pub fn from_parts(
        memory: Arc<dyn Cache<V>>,
        disk: Arc<dyn Cache<V>>,
        fetcher: Arc<dyn Fetcher>,
        codec: Arc<dyn ValueCodec<Value = V>>,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            memory,
            disk,
            coordinator: FetchCoordinator::new(max_concurrent_fetches),
            fetcher,
            codec,
        }
    }

    /// Looks up `identifier` in the caches, without touching the network.
    ///
    /// A value found on disk is promoted into memory. This reads from disk, so it may block.
    pub fn peek(&self, identifier: &str) -> Option<V> {
        let key = CacheKey::for_identifier(identifier);
        lookup(&*self.memory, &*self.disk, &key)
    }

    /// Fetches `identifier` from the caches, or downloads it.
    pub async fn fetch(&self, identifier: &str) -> FetchResult<V> {
        self.request(identifier).await
    }

    /// Like [`fetch`](Self::fetch), but returns a handle that can be cancelled.
    ///
    /// The returned request resolves immediately when the value is in memory. Otherwise it waits
    /// for the coordinated fetch, which looks at the disk first and downloads the resource on a
    /// miss. Dropping the request cancels it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self, identifier: &str) -> ImageRequest<V> {
        let key = CacheKey::for_identifier(identifier);
        metric!(counter("caches.access") += 1);

        if let Some(value) = self.memory.get(&key) {
            return ImageRequest {
                key,
                state: RequestState::Ready(Some(value)),
            };
        }

        let waiter = self.coordinator.request(key.clone(), || self.fill(key.clone()));
        ImageRequest {
            key,
            state: RequestState::Waiting(waiter),
        }
    }

    /// Stops waiting for the request identified by `token`.
    ///
    /// The download is cancelled when no other request waits for it. Returns `false` if the
    /// request already resolved.
    pub fn cancel(&self, key: &CacheKey, token: WaiterToken) -> bool {
        self.coordinator.cancel(key, token)
    }

    /// Removes all values from the in-memory tier.
    ///
    /// The file-system tier is left alone, use [`clear_disk`](Self::clear_disk) for that.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Removes all files from the file-system tier. This may block.
    pub fn clear_disk(&self) {
        self.disk.clear();
    }

    /// Enforces the bounds of both tiers right away. This may block.
    pub fn prune(&self) -> io::Result<PruneStats> {
        self.memory.prune()?;
        self.disk.prune()
    }

    /// Cancels all running downloads.
    ///
    /// Pending and future requests resolve with [`FetchError::Cancelled`], unless they are served
    /// from the caches.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }

    pub fn memory(&self) -> &Arc<dyn Cache<V>> {
        &self.memory
    }

    pub fn disk(&self) -> &Arc<dyn Cache<V>> {
        &self.disk
    }

    /// The number of resources that are currently being fetched.
    pub fn pending_fetches(&self) -> usize {
        self.coordinator.pending_count()
    }

    /// Creates the coordinated operation that fills both tiers for `key`.
    fn fill(&self, key: CacheKey) -> BoxFuture<'static, FetchResult<V>> {
        let memory = Arc::clone(&self.memory);
        let disk = Arc::clone(&self.disk);
        let fetcher = Arc::clone(&self.fetcher);
        let codec = Arc::clone(&self.codec);

        async move {
            let cached = {
                let (memory, disk, key) = (Arc::clone(&memory), Arc::clone(&disk), key.clone());
                tokio::task::spawn_blocking(move || lookup(&*memory, &*disk, &key))
                    .await
                    .map_err(FetchError::from_std_error)?
            };
            if let Some(value) = cached {
                return Ok(value);
            }

            tracing::debug!(%key, "Downloading image");
            let bytes = fetcher.fetch(key.identifier()).await?;
            let value = codec.decode(bytes).map_err(|err| {
                tracing::debug!(%key, error = %err, "Downloaded image is malformed");
                FetchError::from(err)
            })?;

            if let Err(err) = memory.insert(&key, &value) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Failed to cache image in memory",
                );
            }

            let written = {
                let (value, key) = (value.clone(), key.clone());
                tokio::task::spawn_blocking(move || disk.insert(&key, &value)).await
            };
            match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        %key,
                        "Failed to write image to disk cache",
                    );
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        %key,
                        "Disk cache write panicked",
                    );
                }
            }

            Ok(value)
        }
        .boxed()
    }
}

/// Looks up `key` in memory, then on disk, promoting disk hits into memory.
fn lookup<V>(memory: &dyn Cache<V>, disk: &dyn Cache<V>, key: &CacheKey) -> Option<V> {
    if let Some(value) = memory.get(key) {
        return Some(value);
    }

    let value = disk.get(key)?;
    if let Err(err) = memory.insert(key, &value) {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            %key,
            "Failed to cache image in memory",
        );
    }
    Some(value)
}

enum RequestState<V: Clone + Send + 'static> {
    Ready(Option<V>),
    Waiting(FetchWaiter<V>),
}

/// A pending [`ImageService::request`].
///
/// Resolves to the requested value, or to the reason it could not be fetched. Dropping an
/// unresolved request cancels it.
pub struct ImageRequest<V: Clone + Send + 'static> {
    key: CacheKey,
    state: RequestState<V>,
}

// The value is only ever moved out, never pinned.
impl<V: Clone + Send + 'static> Unpin for ImageRequest<V> {}

impl<V: Clone + Send + 'static> fmt::Debug for ImageRequest<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("key", &self.key)
            .field("token", &self.token())
            .finish()
    }
}

impl<V: Clone + Send + 'static> ImageRequest<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The token to [`cancel`](ImageService::cancel) this request with.
    ///
    /// Requests served from memory have no token, as there is nothing to cancel.
    pub fn token(&self) -> Option<WaiterToken> {
        match &self.state {
            RequestState::Ready(_) => None,
            RequestState::Waiting(waiter) => Some(waiter.token()),
        }
    }

    /// Stops waiting for this request.
    ///
    /// Returns `false` if there was nothing to cancel.
    pub fn cancel(self) -> bool {
        match self.state {
            RequestState::Ready(_) => false,
            RequestState::Waiting(waiter) => waiter.cancel(),
        }
    }
}

impl<V: Clone + Send + 'static> Future for ImageRequest<V> {
    type Output = FetchResult<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            RequestState::Ready(value) => {
                Poll::Ready(Ok(value.take().expect("ImageRequest polled after completion")))
            }
            RequestState::Waiting(waiter) => Pin::new(waiter).poll(cx),
        }
    }
}
