//! The query cache store: entries, single-flight fetches, subscribers and GC.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, QueryError};
use crate::gc::GcScheduler;
use crate::key::CanonicalKey;
use crate::state::{QueryState, QueryStatus, UpdatedAt};

/// The future produced by a query function.
pub type QueryFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// A zero-argument asynchronous operation producing a query's value.
pub type QueryFn<T> = Arc<dyn Fn() -> QueryFuture<T> + Send + Sync>;

/// A change-notification callback.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Build a [`QueryFn`] from an async closure.
///
/// ```ignore
/// let products = query_fn(|| async { Ok(vec!["apple".to_string()]) });
/// ```
pub fn query_fn<T, F, Fut>(f: F) -> QueryFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Storage and fetch orchestration behind a [`QueryClient`](crate::QueryClient).
///
/// Keys are already canonical. Implementations other than [`QueryCache`]
/// (test doubles, instrumented stores) can be put behind the same client.
#[async_trait]
pub trait QueryStore<T: Send + Sync + 'static>: Send + Sync {
    /// Fetch a query, loading it directly or revalidating it in the background.
    async fn fetch_query(&self, key: &CanonicalKey, query_fn: QueryFn<T>, initial_data: Option<T>);

    /// Reload a query with its recorded query function, ignoring staleness.
    async fn refetch_query(&self, key: &CanonicalKey) -> Result<(), CacheError>;

    /// Mark a query stale and revalidate it if it has a query function.
    async fn invalidate_query(&self, key: &CanonicalKey);

    /// Stop tracking the in-flight fetch for a query.
    fn cancel_query(&self, key: &CanonicalKey);

    /// Write a value directly.
    fn set_data(&self, key: &CanonicalKey, data: T);

    /// Register a change listener.
    fn subscribe(&self, key: &CanonicalKey, listener: Listener) -> Subscription;

    /// Get a snapshot of a query's state.
    fn get_state(&self, key: &CanonicalKey) -> Option<QueryState<T>>;

    /// Check if a query has an entry.
    fn has_query(&self, key: &CanonicalKey) -> bool;

    /// Drop every entry, fetch registration, subscriber and GC timer.
    fn clear(&self);
}

/// Handle returned by `subscribe`.
///
/// Unsubscribes when [`unsubscribe`](Subscription::unsubscribe) is called or
/// when dropped, whichever comes first.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Remove the listener.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

struct CacheEntry<T> {
    state: QueryState<T>,
    query_fn: Option<QueryFn<T>>,
}

struct Inner<T> {
    entries: HashMap<CanonicalKey, CacheEntry<T>>,
    /// Generation of the fetch currently accepted for each key.
    in_flight: HashMap<CanonicalKey, u64>,
    subscribers: HashMap<CanonicalKey, BTreeMap<u64, Listener>>,
    gc: GcScheduler,
    next_id: u64,
}

impl<T: Clone> Inner<T> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Commit a state and return the listeners to notify along with the
    /// entry it replaced.
    fn commit(
        &mut self,
        key: &CanonicalKey,
        state: QueryState<T>,
        query_fn: Option<QueryFn<T>>,
    ) -> Committed<T> {
        let from = self.entries.get(key).map(|e| e.state.status);
        debug!(key = %key, from = ?from, to = %state.status, "query transition");

        let replaced = self.entries.insert(key.clone(), CacheEntry { state, query_fn });
        Committed {
            listeners: self.listeners(key),
            replaced,
        }
    }

    fn listeners(&self, key: &CanonicalKey) -> Vec<Listener> {
        self.subscribers
            .get(key)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    fn register_fetch(&mut self, key: &CanonicalKey) -> u64 {
        let generation = self.next_id();
        self.in_flight.insert(key.clone(), generation);
        generation
    }

    /// Drop the registration of a settling fetch.
    ///
    /// Returns `false` if the fetch was cancelled, collected or replaced, in
    /// which case its result must be discarded.
    fn settle_fetch(&mut self, key: &CanonicalKey, generation: u64) -> bool {
        match self.in_flight.get(key) {
            Some(current) if *current == generation => {
                self.in_flight.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Outcome of a commit, released once the store lock is dropped.
///
/// The replaced entry and the listeners may own a [`Subscription`] or
/// anything else that calls back into the cache.
#[must_use]
struct Committed<T> {
    listeners: Vec<Listener>,
    replaced: Option<CacheEntry<T>>,
}

impl<T> Committed<T> {
    fn notify(self) {
        drop(self.replaced);
        notify(self.listeners);
    }
}

struct Shared<T> {
    config: CacheConfig,
    inner: Mutex<Inner<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // Critical sections never leave the maps half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn collect(&self, key: &CanonicalKey, timer: u64) {
        let mut inner = self.lock();
        if !inner.gc.take_fired(key, timer) {
            return;
        }

        let entry = inner.entries.remove(key);
        let subscribers = inner.subscribers.remove(key);
        inner.in_flight.remove(key);
        drop(inner);

        debug!(key = %key, "query garbage collected");
        drop(entry);
        drop(subscribers);
    }
}

/// In-memory query cache.
///
/// Cloning is cheap and yields a handle to the same cache. All state
/// transitions happen under a single lock that is never held across an
/// `.await` or while listeners run, so each transition is observed whole.
pub struct QueryCache<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for QueryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("QueryCache")
            .field("config", &self.shared.config)
            .field("entries", &inner.entries.len())
            .field("in_flight", &inner.in_flight.len())
            .field("subscribed_keys", &inner.subscribers.len())
            .finish()
    }
}

impl<T> Default for QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<T> QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    entries: HashMap::new(),
                    in_flight: HashMap::new(),
                    subscribers: HashMap::new(),
                    gc: GcScheduler::default(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Fetch a query.
    ///
    /// A key with no entry is loaded directly. Otherwise the entry is
    /// revalidated in the background if stale.
    ///
    /// An existing entry that is `idle` (after a cancellation) or `error` is
    /// also loaded directly rather than sent down the background path. The
    /// background path only revalidates successful data and would leave such
    /// an entry unfetchable, whereas a failed or cancelled query must be
    /// retried on its next access.
    pub async fn fetch_query(&self, key: &CanonicalKey, query_fn: QueryFn<T>, initial_data: Option<T>) {
        let direct = {
            let inner = self.shared.lock();
            inner
                .entries
                .get(key)
                .map_or(true, |e| matches!(e.state.status, QueryStatus::Idle | QueryStatus::Error))
        };

        if direct {
            self.direct_fetch(key, query_fn, initial_data).await;
        } else {
            self.background_fetch(key, query_fn).await;
        }
    }

    /// Reload a query with its recorded query function, ignoring staleness.
    pub async fn refetch_query(&self, key: &CanonicalKey) -> Result<(), CacheError> {
        let query_fn = self
            .shared
            .lock()
            .entries
            .get(key)
            .and_then(|e| e.query_fn.clone())
            .ok_or_else(|| CacheError::NoQueryFn(key.clone()))?;

        self.direct_fetch(key, query_fn, None).await;
        Ok(())
    }

    /// Force a query stale, then revalidate it if it has a query function.
    pub async fn invalidate_query(&self, key: &CanonicalKey) {
        let (query_fn, committed) = {
            let mut inner = self.shared.lock();
            let Some(entry) = inner.entries.get(key) else {
                return;
            };

            let state = QueryState {
                status: QueryStatus::Success,
                data: entry.state.data.clone(),
                error: None,
                last_updated_at: UpdatedAt::ForceStale,
            };
            let query_fn = entry.query_fn.clone();
            let committed = inner.commit(key, state, query_fn.clone());
            (query_fn, committed)
        };
        committed.notify();

        if let Some(query_fn) = query_fn {
            self.background_fetch(key, query_fn).await;
        }
    }

    /// Stop accepting the result of a query's in-flight fetch.
    ///
    /// The fetch itself keeps running; its result is discarded when it
    /// settles. No-op unless the key has both an entry and a fetch in flight.
    pub fn cancel_query(&self, key: &CanonicalKey) {
        let committed = {
            let mut inner = self.shared.lock();
            if !inner.in_flight.contains_key(key) {
                return;
            }
            let Some(entry) = inner.entries.get(key) else {
                return;
            };

            let state = QueryState {
                status: QueryStatus::Idle,
                data: entry.state.data.clone(),
                error: None,
                last_updated_at: UpdatedAt::ForceStale,
            };
            let query_fn = entry.query_fn.clone();
            inner.in_flight.remove(key);
            inner.commit(key, state, query_fn)
        };
        committed.notify();
    }

    /// Write a value directly, bypassing fetch machinery.
    pub fn set_data(&self, key: &CanonicalKey, data: T) {
        let committed = {
            let mut inner = self.shared.lock();
            let query_fn = inner.entries.get(key).and_then(|e| e.query_fn.clone());
            let state = QueryState {
                status: QueryStatus::Success,
                data: Some(data),
                error: None,
                last_updated_at: UpdatedAt::now(),
            };
            inner.commit(key, state, query_fn)
        };
        committed.notify();
    }

    /// Register a change listener for a key.
    ///
    /// When the last listener of a key unsubscribes, the key's GC timer is
    /// (re)armed. Subscribing again does not disarm a pending timer.
    pub fn subscribe<F>(&self, key: &CanonicalKey, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe_listener(key, Arc::new(listener))
    }

    fn subscribe_listener(&self, key: &CanonicalKey, listener: Listener) -> Subscription {
        let id = {
            let mut inner = self.shared.lock();
            let id = inner.next_id();
            inner
                .subscribers
                .entry(key.clone())
                .or_default()
                .insert(id, listener);
            id
        };

        let shared = Arc::downgrade(&self.shared);
        let key = key.clone();
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                unsubscribe(&shared, key, id);
            }
        })
    }

    /// Get a snapshot of a query's state.
    pub fn get_state(&self, key: &CanonicalKey) -> Option<QueryState<T>> {
        self.shared.lock().entries.get(key).map(|e| e.state.clone())
    }

    /// Check if a query has an entry.
    pub fn has_query(&self, key: &CanonicalKey) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    /// Check if a fetch is being tracked for a query.
    pub fn is_fetching(&self, key: &CanonicalKey) -> bool {
        self.shared.lock().in_flight.contains_key(key)
    }

    /// Number of listeners subscribed to a key.
    pub fn subscriber_count(&self, key: &CanonicalKey) -> usize {
        self.shared
            .lock()
            .subscribers
            .get(key)
            .map_or(0, BTreeMap::len)
    }

    /// Check if a GC timer is armed for a key.
    pub fn is_gc_scheduled(&self, key: &CanonicalKey) -> bool {
        self.shared.lock().gc.is_armed(key)
    }

    /// Drop every entry, fetch registration, subscriber and GC timer.
    pub fn clear(&self) {
        let mut inner = self.shared.lock();
        let entries = std::mem::take(&mut inner.entries);
        let subscribers = std::mem::take(&mut inner.subscribers);
        inner.in_flight.clear();
        inner.gc.clear();
        drop(inner);

        drop(entries);
        drop(subscribers);
    }

    async fn direct_fetch(&self, key: &CanonicalKey, query_fn: QueryFn<T>, initial_data: Option<T>) {
        let (generation, had_data, committed) = {
            let mut inner = self.shared.lock();
            if inner.in_flight.contains_key(key) {
                trace!(key = %key, "fetch already in flight");
                return;
            }

            let entry = inner.entries.get(key);
            if entry.is_some_and(|e| e.state.status == QueryStatus::Loading) {
                trace!(key = %key, "query already loading");
                return;
            }
            let had_data = entry.is_some_and(|e| e.state.data.is_some());

            // Unused initial data is released with the other arguments,
            // after the lock.
            if !had_data {
                if let Some(data) = initial_data {
                    let state = QueryState {
                        status: QueryStatus::FirstSuccess,
                        data: Some(data),
                        error: None,
                        last_updated_at: UpdatedAt::now(),
                    };
                    let committed = inner.commit(key, state, Some(query_fn));
                    drop(inner);
                    committed.notify();
                    return;
                }
            }

            let state = QueryState {
                status: QueryStatus::Loading,
                data: None,
                error: None,
                last_updated_at: UpdatedAt::now(),
            };
            let committed = inner.commit(key, state, Some(query_fn.clone()));
            (inner.register_fetch(key), had_data, committed)
        };
        committed.notify();

        let cache = self.clone();
        let key = key.clone();
        self.drive(async move {
            let result = run_query_fn(&query_fn).await;

            let committed = {
                let mut inner = cache.shared.lock();
                if !inner.settle_fetch(&key, generation) {
                    debug!(key = %key, "discarding result of cancelled fetch");
                    return;
                }

                let state = match result {
                    Ok(data) => QueryState {
                        status: if had_data {
                            QueryStatus::Success
                        } else {
                            QueryStatus::FirstSuccess
                        },
                        data: Some(data),
                        error: None,
                        last_updated_at: UpdatedAt::now(),
                    },
                    Err(error) => {
                        debug!(key = %key, %error, "query failed");
                        QueryState {
                            status: QueryStatus::Error,
                            data: None,
                            error: Some(error),
                            last_updated_at: UpdatedAt::ForceStale,
                        }
                    }
                };
                inner.commit(&key, state, Some(query_fn))
            };
            committed.notify();
        })
        .await;
    }

    async fn background_fetch(&self, key: &CanonicalKey, query_fn: QueryFn<T>) {
        let config = self.shared.config;
        let (generation, previous, committed) = {
            let mut inner = self.shared.lock();
            if inner.in_flight.contains_key(key) {
                trace!(key = %key, "fetch already in flight");
                return;
            }
            let Some(entry) = inner.entries.get(key) else {
                return;
            };

            // Also excludes `fetching`.
            let status = entry.state.status;
            if !status.is_success() {
                return;
            }

            if !entry.state.is_stale(config.stale_time) {
                trace!(key = %key, "query is fresh");
                return;
            }

            let within_grace = entry
                .state
                .last_updated_at
                .elapsed()
                .is_some_and(|elapsed| elapsed < config.first_fetch_grace);
            if status == QueryStatus::FirstSuccess && within_grace {
                trace!(key = %key, "query within first fetch grace window");
                return;
            }

            let previous = entry.state.clone();
            let state = QueryState {
                status: QueryStatus::Fetching,
                data: previous.data.clone(),
                error: None,
                last_updated_at: UpdatedAt::now(),
            };
            let committed = inner.commit(key, state, Some(query_fn.clone()));
            (inner.register_fetch(key), previous, committed)
        };
        committed.notify();

        let cache = self.clone();
        let key = key.clone();
        self.drive(async move {
            let result = run_query_fn(&query_fn).await;

            let committed = {
                let mut inner = cache.shared.lock();
                if !inner.settle_fetch(&key, generation) {
                    debug!(key = %key, "discarding result of cancelled fetch");
                    return;
                }

                let state = match result {
                    Ok(data) => QueryState {
                        status: QueryStatus::Success,
                        data: Some(data),
                        error: None,
                        last_updated_at: UpdatedAt::now(),
                    },
                    // Keep serving the previous data and let the next access
                    // re-evaluate staleness from the pre-fetch timestamp.
                    Err(error) => {
                        debug!(key = %key, %error, "background refetch failed, keeping previous data");
                        QueryState {
                            status: QueryStatus::Success,
                            data: previous.data,
                            error: None,
                            last_updated_at: previous.last_updated_at,
                        }
                    }
                };
                inner.commit(&key, state, Some(query_fn))
            };
            committed.notify();
        })
        .await;
    }

    /// Run a settle future on its own task, so that dropping the caller does
    /// not strand the in-flight registration.
    async fn drive(&self, settle: impl Future<Output = ()> + Send + 'static) {
        match Handle::try_current() {
            Ok(runtime) => {
                if let Err(err) = runtime.spawn(settle).await {
                    warn!(error = %err, "query fetch task did not complete");
                }
            }
            Err(_) => settle.await,
        }
    }
}

#[async_trait]
impl<T> QueryStore<T> for QueryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn fetch_query(&self, key: &CanonicalKey, query_fn: QueryFn<T>, initial_data: Option<T>) {
        QueryCache::fetch_query(self, key, query_fn, initial_data).await
    }

    async fn refetch_query(&self, key: &CanonicalKey) -> Result<(), CacheError> {
        QueryCache::refetch_query(self, key).await
    }

    async fn invalidate_query(&self, key: &CanonicalKey) {
        QueryCache::invalidate_query(self, key).await
    }

    fn cancel_query(&self, key: &CanonicalKey) {
        QueryCache::cancel_query(self, key)
    }

    fn set_data(&self, key: &CanonicalKey, data: T) {
        QueryCache::set_data(self, key, data)
    }

    fn subscribe(&self, key: &CanonicalKey, listener: Listener) -> Subscription {
        self.subscribe_listener(key, listener)
    }

    fn get_state(&self, key: &CanonicalKey) -> Option<QueryState<T>> {
        QueryCache::get_state(self, key)
    }

    fn has_query(&self, key: &CanonicalKey) -> bool {
        QueryCache::has_query(self, key)
    }

    fn clear(&self) {
        QueryCache::clear(self)
    }
}

fn unsubscribe<T: Send + 'static>(shared: &Arc<Shared<T>>, key: CanonicalKey, id: u64) {
    let mut inner = shared.lock();
    let Some(set) = inner.subscribers.get_mut(&key) else {
        return;
    };
    let removed = set.remove(&id);
    if set.is_empty() {
        inner.subscribers.remove(&key);
        let weak: Weak<Shared<T>> = Arc::downgrade(shared);
        let delay = shared.config.gc_time;
        let fired_key = key.clone();
        inner.gc.arm(key, delay, move |timer| {
            if let Some(shared) = weak.upgrade() {
                shared.collect(&fired_key, timer);
            }
        });
    }
    drop(inner);

    // The listener may own another subscription to this cache.
    drop(removed);
}

/// Invoke a query function, normalizing failures and panics.
async fn run_query_fn<T>(query_fn: &QueryFn<T>) -> Result<T, QueryError> {
    let attempt = AssertUnwindSafe(async { query_fn().await }).catch_unwind().await;
    match attempt {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(err)) => Err(QueryError::from(err)),
        Err(panic) => Err(QueryError::from_panic(panic)),
    }
}

fn notify(listeners: Vec<Listener>) {
    for listener in listeners {
        listener();
    }
}
