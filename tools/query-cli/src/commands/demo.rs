//! Product catalog scenario.
//!
//! Drives one `["products"]` query through every cache path and reports each
//! change notification as it arrives.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use query_cache::{query_key, QueryClient, QueryKey, QueryObserver, QueryState, QueryStatus};
use serde_json::json;

use super::DemoArgs;
use crate::catalog::{Catalog, Listing, Product};
use crate::context::Context;
use crate::output::{format_duration, status_badge, Output};

const STEPS: usize = 7;

/// Extra wait so timers scheduled at the boundary have fired.
const SETTLE: Duration = Duration::from_millis(100);

/// Run the demo command.
pub async fn run(args: DemoArgs, ctx: &Context) -> Result<()> {
    let config = args.cache_config(ctx.config.cache);
    let policy = ctx.config.fetch.policy();
    ctx.output.debug(&format!("cache config: {:?}", config));
    ctx.output.debug(&format!("fetch policy: {:?}", policy));

    let catalog = Catalog::new(Duration::from_millis(args.latency_ms));
    let products = policy.wrap(catalog.query_fn());
    let client: QueryClient<Listing> = QueryClient::new(config);
    let key = query_key!(["products"]);
    let reporter = Reporter::new(ctx.output);

    ctx.output.header("Product catalog");
    ctx.output.kv("key", key.canonical().as_str());
    ctx.output.kv("latency", &format_duration(Duration::from_millis(args.latency_ms)));
    ctx.output.kv("stale_time", &format_duration(config.stale_time));
    ctx.output.kv("gc_time", &format_duration(config.gc_time));

    let mut view = QueryObserver::new(client.clone(), key.clone()).with_query_fn(products.clone());
    let subscription = view.subscribe(reporter.listener(client.clone(), key.clone()));

    // 1. First load with concurrent callers
    reporter.step(1, "First load with three concurrent fetches");
    let before = catalog.requests();
    tokio::join!(
        view.mount(),
        client.fetch_query(key.clone(), products.clone(), None),
        client.fetch_query(key.clone(), products.clone(), None),
    );
    reporter.outcome(format!(
        "{} catalog request(s) served 3 fetches",
        catalog.requests() - before
    ));

    // 2. Fresh re-read
    reporter.step(2, "Re-read while fresh");
    let before = catalog.requests();
    client.fetch_query(key.clone(), products.clone(), None).await;
    reporter.outcome(format!(
        "{} catalog request(s), showing {} products",
        catalog.requests() - before,
        view.result().data.map_or(0, |listing| listing.products.len())
    ));

    // 3. Stale background refetch
    reporter.step(3, "Background refetch of stale data");
    wait(ctx.output, config.stale_time.max(config.first_fetch_grace) + SETTLE, "for data to go stale").await;
    if args.fail_background {
        catalog.set_failing(true);
    }
    let previous = revision(&client, &key);
    let before = catalog.requests();
    client.fetch_query(key.clone(), products.clone(), None).await;
    catalog.set_failing(false);
    let current = revision(&client, &key);
    if current == previous {
        reporter.outcome(format!(
            "refetch failed after {} request(s), still showing revision {}",
            catalog.requests() - before,
            current.unwrap_or_default()
        ));
    } else {
        reporter.outcome(format!(
            "revision {} replaced revision {}",
            current.unwrap_or_default(),
            previous.unwrap_or_default()
        ));
    }

    // 4. Invalidation
    reporter.step(4, "Invalidate");
    client.invalidate_queries(key.clone()).await;
    reporter.outcome(format!(
        "now showing revision {}",
        revision(&client, &key).unwrap_or_default()
    ));

    // 5. Cancellation
    reporter.step(5, "Cancel an in-flight refetch");
    let refetch = {
        let client = client.clone();
        let key = key.clone();
        tokio::spawn(async move { client.refetch_queries(key).await })
    };
    tokio::time::sleep(Duration::from_millis(args.latency_ms / 2)).await;
    client.cancel_queries(key.clone());
    refetch.await.context("Refetch task failed")??;
    let status = client.get_query_state(key.clone()).map(|state| state.status);
    reporter.outcome(format!(
        "late result discarded, status is {}",
        status.map_or("absent", |s| s.as_str())
    ));
    view.refetch().await?;
    reporter.outcome(format!(
        "reloaded revision {}",
        revision(&client, &key).unwrap_or_default()
    ));

    // 6. Direct write
    reporter.step(6, "Write data directly");
    if let Some(mut listing) = view.result().data {
        let id = listing.products.len() as u32 + 1;
        listing.products.push(Product::new(id, "Gift Card"));
        client.set_query_data(key.clone(), listing);
    }
    if let Some(listing) = view.result().data {
        for product in &listing.products {
            ctx.output.list_item(&product.title);
        }
    }

    // 7. Unsubscribe and collect
    reporter.step(7, "Unsubscribe and wait for GC");
    subscription.unsubscribe();
    let canonical = key.canonical();
    reporter.outcome(format!(
        "gc scheduled: {}",
        client.query_cache().is_gc_scheduled(&canonical)
    ));
    wait(ctx.output, config.gc_time + SETTLE, "for garbage collection").await;
    reporter.outcome(format!("query cached: {}", client.has_query(key.clone())));

    reporter.summary(catalog.requests());
    Ok(())
}

fn revision(client: &QueryClient<Listing>, key: &QueryKey) -> Option<u32> {
    client.get_query_data(key.clone()).map(|listing| listing.revision)
}

async fn wait(output: Output, duration: Duration, reason: &str) {
    let spinner = output.spinner(&format!("waiting {} {}", format_duration(duration), reason));
    tokio::time::sleep(duration).await;
    spinner.finish_and_clear();
}

/// Prints scenario progress as text or JSON lines.
#[derive(Clone)]
struct Reporter {
    output: Output,
    step: Arc<AtomicUsize>,
    notifications: Arc<AtomicUsize>,
}

impl Reporter {
    fn new(output: Output) -> Self {
        Self {
            output,
            step: Arc::new(AtomicUsize::new(0)),
            notifications: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn step(&self, num: usize, name: &str) {
        self.step.store(num, Ordering::SeqCst);
        if self.output.is_json() {
            self.output.json_line(&json!({
                "event": "step",
                "step": num,
                "name": name,
                "at": chrono::Utc::now().to_rfc3339(),
            }));
        } else {
            self.output.step(num, STEPS, name);
        }
    }

    fn outcome(&self, message: String) {
        if self.output.is_json() {
            self.output.json_line(&json!({
                "event": "outcome",
                "step": self.step.load(Ordering::SeqCst),
                "message": message,
                "at": chrono::Utc::now().to_rfc3339(),
            }));
        } else {
            self.output.success(&message);
        }
    }

    fn listener(&self, client: QueryClient<Listing>, key: QueryKey) -> impl Fn() + Send + Sync + 'static {
        let reporter = self.clone();
        move || {
            let state = client
                .get_query_state(key.clone())
                .unwrap_or_else(QueryState::idle);
            reporter.notification(&state);
        }
    }

    fn notification(&self, state: &QueryState<Listing>) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        let revision = state.data.as_ref().map(|listing| listing.revision);
        let error = state.error.as_ref().map(|e| e.message().to_string());

        if self.output.is_json() {
            self.output.json_line(&json!({
                "event": "notification",
                "step": self.step.load(Ordering::SeqCst),
                "status": state.status,
                "revision": revision,
                "error": error,
                "at": chrono::Utc::now().to_rfc3339(),
            }));
            return;
        }

        let detail = match (state.status, revision, error) {
            (QueryStatus::Error, _, Some(error)) => error,
            (_, Some(revision), _) => format!("revision {}", revision),
            _ => "no data".to_string(),
        };
        println!("  {} {}", status_badge(state.status), detail);
    }

    fn summary(&self, requests: u32) {
        let notifications = self.notifications.load(Ordering::SeqCst);
        if self.output.is_json() {
            self.output.json_line(&json!({
                "event": "summary",
                "catalog_requests": requests,
                "notifications": notifications,
            }));
            return;
        }
        self.output.header("Summary");
        self.output.kv("catalog requests", &requests.to_string());
        self.output.kv("notifications", &notifications.to_string());
    }
}
