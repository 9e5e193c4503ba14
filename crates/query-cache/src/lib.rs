//! Client-side query cache.
//!
//! This crate provides:
//! - `QueryKey` / `CanonicalKey` - Structured query identities and their stable string form
//! - `QueryState` / `QueryStatus` - The per-query state machine
//! - `QueryCache` - Single-flight fetching, background revalidation and subscriber-driven GC
//! - `QueryClient` - Key-canonicalizing facade over a `QueryStore`
//! - `QueryObserver` - Render-agnostic binding of one query to a client
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use query_cache::{query_fn, query_key, CacheConfig, QueryClient};
//!
//! let client = QueryClient::new(CacheConfig::new().with_stale_time(Duration::from_secs(300)));
//!
//! let products = query_fn(|| async { Ok(vec!["lamp".to_string(), "desk".to_string()]) });
//! client.fetch_query(query_key!(["products", { "page": 1 }]), products, None).await;
//!
//! let data = client.get_query_data(query_key!(["products", { "page": 1 }]));
//! ```

mod client;
mod config;
mod error;
mod gc;
mod key;
mod observer;
mod state;
mod store;

pub use client::*;
pub use config::*;
pub use error::*;
pub use key::*;
pub use observer::*;
pub use state::*;
pub use store::*;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
