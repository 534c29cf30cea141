use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};

use futures::future::{BoxFuture, FutureExt};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, FetchError, FetchResult};
use crate::utils::futures::CallOnDrop;

/// Identifies a single waiter of a pending fetch.
///
/// Tokens are unique for the lifetime of a [`FetchCoordinator`], so a stale token never cancels
/// somebody else's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterToken(u64);

struct Waiter<V> {
    token: WaiterToken,
    sender: oneshot::Sender<FetchResult<V>>,
}

/// The single in-flight fetch for one key.
struct PendingFetch<V> {
    /// Distinguishes this fetch from earlier and later ones for the same key.
    generation: u64,
    waiters: Vec<Waiter<V>>,
    cancel: CancellationToken,
}

struct Inner<V> {
    pending: Mutex<HashMap<CacheKey, PendingFetch<V>>>,
    next_id: AtomicU64,
    permits: Semaphore,
}

impl<V> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, PendingFetch<V>>> {
        // The table is consistent at every point where we could panic while holding the lock.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<V: Clone + Send + 'static> Inner<V> {
    /// Runs the fetch operation and delivers its result.
    async fn run(
        self: Arc<Self>,
        key: CacheKey,
        generation: u64,
        cancel: CancellationToken,
        operation: BoxFuture<'static, FetchResult<V>>,
    ) {
        // In case the runtime drops this task before it finishes, nobody must be left waiting.
        let abandoned = CallOnDrop::new({
            let inner = Arc::clone(&self);
            let key = key.clone();
            move || inner.complete(&key, generation, Err(FetchError::Cancelled))
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.execute(operation) => result,
        };

        abandoned.disarm();
        self.complete(&key, generation, result);
    }

    async fn execute(&self, operation: BoxFuture<'static, FetchResult<V>>) -> FetchResult<V> {
        // The semaphore is only closed on shutdown.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Cancelled)?;

        metric!(counter("caches.computation") += 1);

        match AssertUnwindSafe(operation).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("unknown panic");
                tracing::error!(panic = message, "Fetch operation panicked");
                Err(FetchError::InternalError)
            }
        }
    }

    /// Delivers `result` to every waiter of the fetch for `key`, if it is still the pending fetch
    /// of the given `generation`.
    ///
    /// If the fetch was cancelled or shut down in the meantime, this does nothing.
    fn complete(&self, key: &CacheKey, generation: u64, result: FetchResult<V>) {
        let waiters = {
            let mut pending = self.lock();
            match pending.entry(key.clone()) {
                Entry::Occupied(entry) if entry.get().generation == generation => {
                    entry.remove().waiters
                }
                _ => return,
            }
        };

        for waiter in waiters {
            // the receiver may have been dropped concurrently
            waiter.sender.send(result.clone()).ok();
        }
    }
}

/// Deduplicates concurrent fetches of the same resource.
///
/// For every [`CacheKey`], at most one fetch operation is running at any time. All requests for a
/// key that arrive while its fetch is running wait for that same fetch, and each of them receives
/// a clone of its result. Once the result is delivered, the fetch is forgotten: the next request
/// starts a new one. Errors are not retried here.
///
/// Fetch operations are spawned on the tokio runtime, and at most `max_concurrent_fetches` of
/// them run at the same time. Cancelling the last waiter of a fetch cancels the fetch itself by
/// dropping its future.
pub struct FetchCoordinator<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for FetchCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for FetchCoordinator<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.pending.try_lock().map(|p| p.len()).ok();
        f.debug_struct("FetchCoordinator")
            .field("pending", &pending)
            .field("available_permits", &self.inner.permits.available_permits())
            .finish()
    }
}

impl<V: Clone + Send + 'static> FetchCoordinator<V> {
    /// Creates a coordinator that runs up to `max_concurrent_fetches` operations at once.
    pub fn new(max_concurrent_fetches: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Default::default(),
                next_id: AtomicU64::new(1),
                permits: Semaphore::new(max_concurrent_fetches.max(1)),
            }),
        }
    }

    /// Registers a waiter for the result of fetching `key`.
    ///
    /// If a fetch for `key` is already running, the returned waiter joins it and `producer` is not
    /// called. Otherwise `producer` is called exactly once to create the fetch operation, which is
    /// spawned right away.
    ///
    /// `producer` runs without the coordinator's lock held, so it may call back into the
    /// coordinator. It should only build the operation, though: requests for `key` that arrive
    /// while it runs join the new fetch and wait for the operation it returns.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request<F>(&self, key: CacheKey, producer: F) -> FetchWaiter<V>
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult<V>>,
    {
        let token = WaiterToken(self.inner.next_id());
        let (sender, receiver) = oneshot::channel();
        let waiter = Waiter { token, sender };

        let spawn = {
            let mut pending = self.inner.lock();
            match pending.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    metric!(counter("caches.channel.hit") += 1);
                    entry.get_mut().waiters.push(waiter);
                    None
                }
                Entry::Vacant(entry) => {
                    metric!(counter("caches.channel.miss") += 1);
                    let generation = self.inner.next_id();
                    let cancel = CancellationToken::new();
                    entry.insert(PendingFetch {
                        generation,
                        waiters: vec![waiter],
                        cancel: cancel.clone(),
                    });
                    Some((generation, cancel))
                }
            }
        };

        if let Some((generation, cancel)) = spawn {
            // If the producer panics, the fetch it was supposed to start must not linger.
            let failed = CallOnDrop::new({
                let inner = Arc::clone(&self.inner);
                let key = key.clone();
                move || inner.complete(&key, generation, Err(FetchError::InternalError))
            });
            let operation = producer();
            failed.disarm();

            tracing::trace!(%key, generation, "Starting fetch");
            let task = Arc::clone(&self.inner).run(key.clone(), generation, cancel, operation);
            tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        }

        FetchWaiter {
            key,
            token,
            receiver,
            coordinator: self.clone(),
            finished: false,
        }
    }

    /// Removes the waiter identified by `token` from the fetch for `key`.
    ///
    /// If it was the last waiter, the fetch itself is cancelled and forgotten. Returns `false` if
    /// there is no such waiter, for example because the result was already delivered.
    pub fn cancel(&self, key: &CacheKey, token: WaiterToken) -> bool {
        let mut pending = self.inner.lock();
        let Some(fetch) = pending.get_mut(key) else {
            return false;
        };
        let Some(position) = fetch.waiters.iter().position(|w| w.token == token) else {
            return false;
        };

        // Dropping the sender resolves the waiter with `Cancelled`.
        fetch.waiters.remove(position);

        if fetch.waiters.is_empty() {
            if let Some(fetch) = pending.remove(key) {
                tracing::trace!(%key, generation = fetch.generation, "Cancelling fetch");
                metric!(counter("caches.cancelled") += 1);
                fetch.cancel.cancel();
            }
        }
        true
    }

    /// Cancels all pending fetches, resolving their waiters with [`FetchError::Cancelled`].
    ///
    /// Requests made after shutdown resolve with [`FetchError::Cancelled`] as well.
    pub fn shutdown(&self) {
        self.inner.permits.close();
        let drained: Vec<_> = self.inner.lock().drain().collect();

        for (key, fetch) in drained {
            tracing::trace!(%key, generation = fetch.generation, "Cancelling fetch on shutdown");
            fetch.cancel.cancel();
            for waiter in fetch.waiters {
                waiter.sender.send(Err(FetchError::Cancelled)).ok();
            }
        }
    }

    /// The number of keys with a running fetch.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// The number of waiters of the running fetch for `key`.
    pub fn waiter_count(&self, key: &CacheKey) -> usize {
        self.inner.lock().get(key).map_or(0, |f| f.waiters.len())
    }
}

/// Resolves to the result of a fetch requested through [`FetchCoordinator::request`].
///
/// Dropping the waiter before it resolved cancels it, the same as [`FetchWaiter::cancel`].
#[must_use = "dropping a FetchWaiter cancels it"]
pub struct FetchWaiter<V: Clone + Send + 'static> {
    key: CacheKey,
    token: WaiterToken,
    receiver: oneshot::Receiver<FetchResult<V>>,
    coordinator: FetchCoordinator<V>,
    finished: bool,
}

impl<V: Clone + Send + 'static> fmt::Debug for FetchWaiter<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchWaiter")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<V: Clone + Send + 'static> FetchWaiter<V> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn token(&self) -> WaiterToken {
        self.token
    }

    /// Stops waiting for the result.
    ///
    /// Returns `false` if the result had already been delivered.
    pub fn cancel(mut self) -> bool {
        self.finished = true;
        self.coordinator.cancel(&self.key, self.token)
    }
}

impl<V: Clone + Send + 'static> Future for FetchWaiter<V> {
    type Output = FetchResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.receiver).poll(cx));
        self.finished = true;
        // A closed channel means this waiter was cancelled.
        Poll::Ready(result.unwrap_or_else(|_| Err(FetchError::Cancelled)))
    }
}

impl<V: Clone + Send + 'static> Drop for FetchWaiter<V> {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator.cancel(&self.key, self.token);
        }
    }
}
