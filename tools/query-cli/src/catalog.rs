//! Simulated product catalog service.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use query_cache::{query_fn, QueryFn};
use serde::Serialize;
use tracing::debug;

const TITLES: [&str; 5] = [
    "Essence Mascara Lash Princess",
    "Eyeshadow Palette with Mirror",
    "Powder Canister",
    "Red Lipstick",
    "Red Nail Polish",
];

/// A product card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    /// Catalog identifier, starting at 1.
    pub id: u32,
    /// Display name.
    pub title: String,
    /// Thumbnail path.
    pub image: String,
}

impl Product {
    pub fn new(id: u32, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            image: format!("/images/products/{}/thumbnail.png", id),
        }
    }
}

/// One response from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    /// Request number that produced this listing.
    pub revision: u32,
    /// Products in catalog order.
    pub products: Vec<Product>,
}

/// Catalog service with fixed latency and switchable failure.
#[derive(Debug)]
pub struct Catalog {
    latency: Duration,
    requests: AtomicU32,
    failing: AtomicBool,
}

impl Catalog {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            requests: AtomicU32::new(0),
            failing: AtomicBool::new(false),
        })
    }

    /// Make subsequent requests fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of requests served so far, failed ones included.
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub async fn fetch(&self) -> anyhow::Result<Listing> {
        let revision = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(request = revision, "catalog request");

        tokio::time::sleep(self.latency).await;
        if self.failing.load(Ordering::SeqCst) {
            bail!("catalog service returned 503 (request {})", revision);
        }

        let products = TITLES
            .iter()
            .zip(1..)
            .map(|(title, id)| Product::new(id, title))
            .collect();
        Ok(Listing { revision, products })
    }

    /// The catalog fetch as a query function.
    pub fn query_fn(self: &Arc<Self>) -> QueryFn<Listing> {
        let catalog = Arc::clone(self);
        query_fn(move || {
            let catalog = Arc::clone(&catalog);
            async move { catalog.fetch().await }
        })
    }
}
