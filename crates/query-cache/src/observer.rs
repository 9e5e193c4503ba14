//! Binding of a single query to a client, for rendering layers.

use crate::client::QueryClient;
use crate::error::CacheError;
use crate::key::QueryKey;
use crate::state::{QueryResult, QueryState};
use crate::store::{QueryCache, QueryFn, QueryStore, Subscription};

/// Observes one query on behalf of a view.
///
/// A renderer mounts the observer once, subscribes for change
/// notifications, and reads [`result`](QueryObserver::result) whenever it is
/// notified.
pub struct QueryObserver<T, S = QueryCache<T>> {
    client: QueryClient<T, S>,
    key: QueryKey,
    query_fn: Option<QueryFn<T>>,
    initial_data: Option<T>,
    enabled: bool,
    mounted: bool,
}

impl<T, S> QueryObserver<T, S>
where
    T: Clone + Send + Sync + 'static,
    S: QueryStore<T>,
{
    /// Create an observer for `key`.
    pub fn new(client: QueryClient<T, S>, key: impl Into<QueryKey>) -> Self {
        Self {
            client,
            key: key.into(),
            query_fn: None,
            initial_data: None,
            enabled: true,
            mounted: false,
        }
    }

    /// Set the query function.
    pub fn with_query_fn(mut self, query_fn: QueryFn<T>) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    /// Seed the query with data shown before the first fetch completes.
    pub fn with_initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Enable or disable the initial fetch.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Get the observed key.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Run the initial fetch.
    ///
    /// Only the first call on an enabled observer with a query function
    /// fetches; later calls are no-ops.
    pub async fn mount(&mut self) {
        if !self.enabled || self.mounted {
            return;
        }
        let Some(query_fn) = self.query_fn.clone() else {
            return;
        };

        self.mounted = true;
        self.client
            .fetch_query(self.key.clone(), query_fn, self.initial_data.clone())
            .await;
    }

    /// Register a change listener for the observed query.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.client.subscribe(self.key.clone(), listener)
    }

    /// Get what the view should show right now.
    pub fn result(&self) -> QueryResult<T> {
        self.client
            .get_query_state(self.key.clone())
            .unwrap_or_else(QueryState::idle)
            .into()
    }

    /// Reload the query, ignoring staleness.
    ///
    /// No-op when the observer has no query function.
    pub async fn refetch(&self) -> Result<(), CacheError> {
        if self.query_fn.is_none() {
            return Ok(());
        }
        self.client.refetch_queries(self.key.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::CacheConfig;
    use crate::state::QueryStatus;
    use crate::store::query_fn;

    fn counting_fn(calls: Arc<AtomicUsize>) -> QueryFn<Vec<&'static str>> {
        query_fn(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec!["lamp", "desk"])
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_fetches_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = QueryClient::new(CacheConfig::default());
        let mut observer =
            QueryObserver::new(client, vec!["products"]).with_query_fn(counting_fn(calls.clone()));

        assert_eq!(observer.result().status, QueryStatus::Idle);

        observer.mount().await;
        observer.mount().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let result = observer.result();
        assert!(result.is_success);
        assert_eq!(result.data, Some(vec!["lamp", "desk"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_observer_does_not_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = QueryClient::new(CacheConfig::default());
        let mut observer = QueryObserver::new(client, "products")
            .with_query_fn(counting_fn(calls.clone()))
            .enabled(false);

        observer.mount().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(observer.result().status, QueryStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_data_is_shown_without_fetching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = QueryClient::new(CacheConfig::default());
        let mut observer = QueryObserver::new(client, "products")
            .with_query_fn(counting_fn(calls.clone()))
            .with_initial_data(vec!["cached"]);

        observer.mount().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(observer.result().data, Some(vec!["cached"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_without_query_fn_is_noop() {
        let client: QueryClient<u32> = QueryClient::new(CacheConfig::default());
        let observer = QueryObserver::new(client, "products");
        assert!(observer.refetch().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_sees_each_transition() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = QueryClient::new(CacheConfig::default());
        let mut observer =
            QueryObserver::new(client.clone(), "products").with_query_fn(counting_fn(calls));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = seen.clone();
        let reader = client.clone();
        let _subscription = observer.subscribe(move || {
            let status = reader.get_query_state("products").map(|s| s.status);
            log.lock().unwrap().push(status);
        });

        observer.mount().await;
        observer.refetch().await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                Some(QueryStatus::Loading),
                Some(QueryStatus::FirstSuccess),
                Some(QueryStatus::Loading),
                Some(QueryStatus::Success),
            ]
        );
    }
}
