//! CLI configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use query_cache::CacheConfig;
use query_fetch::{BackoffStrategy, FetchPolicy, RetryPolicy, TimeoutConfig};
use serde::{Deserialize, Serialize};

/// Config file names searched for when `--config` is not given.
pub const CONFIG_NAMES: [&str; 3] = ["query.toml", ".query.toml", "query.json"];

/// CLI configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Cache timings.
    #[serde(default = "interactive_cache")]
    pub cache: CacheConfig,

    /// Retry and timeout policy wrapped around the catalog fetch.
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            cache: interactive_cache(),
            fetch: FetchConfig::default(),
        }
    }
}

impl CliConfig {
    /// Load config from a file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path))
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path))
        }
    }
}

/// Cache timings short enough to watch every transition in one run.
fn interactive_cache() -> CacheConfig {
    CacheConfig::new()
        .with_stale_time(Duration::from_secs(1))
        .with_gc_time(Duration::from_secs(2))
        .with_first_fetch_grace(Duration::from_millis(500))
}

/// Fetch policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry up to eight times this value.
    pub backoff_ms: u64,
    /// Bound on a single attempt.
    pub attempt_timeout_ms: u64,
    /// Bound on all attempts.
    pub total_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 100,
            attempt_timeout_ms: 2_000,
            total_timeout_ms: 10_000,
        }
    }
}

impl FetchConfig {
    /// Build the fetch policy.
    pub fn policy(&self) -> FetchPolicy {
        let base = Duration::from_millis(self.backoff_ms);
        let backoff = if self.backoff_ms == 0 {
            BackoffStrategy::None
        } else {
            BackoffStrategy::Exponential { base, max: base * 8 }
        };

        FetchPolicy::new(
            TimeoutConfig::new(
                Duration::from_millis(self.attempt_timeout_ms),
                Duration::from_millis(self.total_timeout_ms),
            ),
            RetryPolicy::new(self.max_retries).with_backoff(backoff),
        )
    }
}

/// Generate a default query.toml config file.
pub fn generate_default_config() -> String {
    r#"# Query cache configuration

[cache]
# How long fetched data counts as fresh.
stale_time_ms = 1000
# How long an unobserved query survives its last subscriber.
gc_time_ms = 2000
# Suppresses background refetches right after the first load.
first_fetch_grace_ms = 500

[fetch]
max_retries = 2
backoff_ms = 100
attempt_timeout_ms = 2000
total_timeout_ms = 10000
"#
    .to_string()
}
