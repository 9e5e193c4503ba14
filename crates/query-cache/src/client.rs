//! Key-canonicalizing front door to a query store.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::key::QueryKey;
use crate::state::QueryState;
use crate::store::{QueryCache, QueryFn, QueryStore, Subscription};

/// Facade applications use instead of touching a store with raw keys.
///
/// Every operation canonicalizes its key and delegates to the store.
pub struct QueryClient<T, S = QueryCache<T>> {
    store: S,
    _data: PhantomData<fn() -> T>,
}

impl<T> QueryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a client owning a new in-memory cache.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_store(QueryCache::new(config))
    }
}

impl<T> Default for QueryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<T, S> QueryClient<T, S>
where
    T: Send + Sync + 'static,
    S: QueryStore<T>,
{
    /// Create a client over an existing store.
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            _data: PhantomData,
        }
    }

    /// Get the current data for a query.
    pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<T> {
        self.get_query_state(key).and_then(|state| state.data)
    }

    /// Get a snapshot of a query's state.
    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState<T>> {
        self.store.get_state(&key.into().canonical())
    }

    /// Check if a query has an entry.
    pub fn has_query(&self, key: impl Into<QueryKey>) -> bool {
        self.store.has_query(&key.into().canonical())
    }

    /// Write a value directly.
    pub fn set_query_data(&self, key: impl Into<QueryKey>, data: T) {
        self.store.set_data(&key.into().canonical(), data);
    }

    /// Fetch a query, optionally seeding it with initial data.
    pub async fn fetch_query(&self, key: impl Into<QueryKey>, query_fn: QueryFn<T>, initial_data: Option<T>) {
        let key = key.into().canonical();
        self.store.fetch_query(&key, query_fn, initial_data).await;
    }

    /// Register a change listener.
    pub fn subscribe<F>(&self, key: impl Into<QueryKey>, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.store.subscribe(&key.into().canonical(), Arc::new(listener))
    }

    /// Mark a query stale and revalidate it.
    pub async fn invalidate_queries(&self, key: impl Into<QueryKey>) {
        let key = key.into().canonical();
        self.store.invalidate_query(&key).await;
    }

    /// Reload a query with its recorded query function.
    pub async fn refetch_queries(&self, key: impl Into<QueryKey>) -> Result<(), CacheError> {
        let key = key.into().canonical();
        self.store.refetch_query(&key).await
    }

    /// Stop tracking a query's in-flight fetch.
    pub fn cancel_queries(&self, key: impl Into<QueryKey>) {
        self.store.cancel_query(&key.into().canonical());
    }

    /// Reset the store.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Get the underlying store.
    pub fn query_cache(&self) -> &S {
        &self.store
    }
}

impl<T, S: Clone> Clone for QueryClient<T, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _data: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::key::CanonicalKey;
    use crate::query_key;
    use crate::state::{QueryStatus, UpdatedAt};
    use crate::store::{query_fn, Listener};

    /// Records the canonical key of every call.
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<(&'static str, String)>>,
        data: Mutex<HashMap<CanonicalKey, u32>>,
    }

    impl RecordingStore {
        fn record(&self, op: &'static str, key: &CanonicalKey) {
            self.calls.lock().unwrap().push((op, key.to_string()));
        }
    }

    #[async_trait]
    impl QueryStore<u32> for RecordingStore {
        async fn fetch_query(&self, key: &CanonicalKey, _query_fn: QueryFn<u32>, _initial: Option<u32>) {
            self.record("fetch", key);
        }

        async fn refetch_query(&self, key: &CanonicalKey) -> Result<(), CacheError> {
            self.record("refetch", key);
            Err(CacheError::NoQueryFn(key.clone()))
        }

        async fn invalidate_query(&self, key: &CanonicalKey) {
            self.record("invalidate", key);
        }

        fn cancel_query(&self, key: &CanonicalKey) {
            self.record("cancel", key);
        }

        fn set_data(&self, key: &CanonicalKey, data: u32) {
            self.record("set", key);
            self.data.lock().unwrap().insert(key.clone(), data);
        }

        fn subscribe(&self, key: &CanonicalKey, _listener: Listener) -> Subscription {
            self.record("subscribe", key);
            QueryCache::<u32>::default().subscribe(key, || {})
        }

        fn get_state(&self, key: &CanonicalKey) -> Option<QueryState<u32>> {
            self.data.lock().unwrap().get(key).map(|data| QueryState {
                status: QueryStatus::Success,
                data: Some(*data),
                error: None,
                last_updated_at: UpdatedAt::now(),
            })
        }

        fn has_query(&self, key: &CanonicalKey) -> bool {
            self.data.lock().unwrap().contains_key(key)
        }

        fn clear(&self) {
            self.calls.lock().unwrap().push(("clear", String::new()));
        }
    }

    #[tokio::test]
    async fn test_every_operation_canonicalizes_keys() {
        let client: QueryClient<u32, _> = QueryClient::with_store(RecordingStore::default());

        client.fetch_query(query_key!({"b": 2, "a": 1}), query_fn(|| async { Ok(1) }), None).await;
        client.invalidate_queries(query_key!({"b": 2, "a": 1})).await;
        assert!(client.refetch_queries(query_key!({"a": 1, "b": 2})).await.is_err());
        client.cancel_queries(query_key!({"a": 1, "b": 2}));
        let _subscription = client.subscribe(query_key!({"b": 2, "a": 1}), || {});

        let calls = client.query_cache().calls.lock().unwrap().clone();
        let expected = r#"{"a":1,"b":2}"#;
        assert_eq!(calls.len(), 5);
        assert!(calls.iter().all(|(_, key)| key == expected));
    }

    #[test]
    fn test_data_round_trips_through_equivalent_keys() {
        let client: QueryClient<u32, _> = QueryClient::with_store(RecordingStore::default());

        client.set_query_data(query_key!(["products", {"sort": "price", "page": 1}]), 42);

        let same = query_key!(["products", {"page": 1, "sort": "price"}]);
        assert!(client.has_query(same.clone()));
        assert_eq!(client.get_query_data(same), Some(42));
        assert_eq!(client.get_query_data(query_key!(["products", {"page": 2}])), None);
    }

    #[test]
    fn test_clear_delegates() {
        let client: QueryClient<u32, _> = QueryClient::with_store(RecordingStore::default());
        client.clear();
        assert_eq!(client.query_cache().calls.lock().unwrap()[0].0, "clear");
    }
}
