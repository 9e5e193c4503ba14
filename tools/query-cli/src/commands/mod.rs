//! CLI command implementations.

pub mod config;
pub mod demo;

use std::time::Duration;

use clap::{Args, Subcommand};
use query_cache::CacheConfig;

/// Arguments for the demo command.
#[derive(Args)]
pub struct DemoArgs {
    /// Simulated catalog latency in milliseconds.
    #[arg(long, default_value = "300")]
    pub latency_ms: u64,

    /// Make the stale background refetch fail.
    #[arg(long)]
    pub fail_background: bool,

    /// Override the configured stale time.
    #[arg(long)]
    pub stale_ms: Option<u64>,

    /// Override the configured GC delay.
    #[arg(long)]
    pub gc_ms: Option<u64>,
}

impl DemoArgs {
    /// Apply command-line overrides on top of the configured cache timings.
    pub fn cache_config(&self, base: CacheConfig) -> CacheConfig {
        let mut config = base;
        if let Some(ms) = self.stale_ms {
            config = config.with_stale_time(Duration::from_millis(ms));
        }
        if let Some(ms) = self.gc_ms {
            config = config.with_gc_time(Duration::from_millis(ms));
        }
        config
    }
}

/// Arguments for the config command.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration.
    Show,
    /// Initialize a new config file.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate the configuration.
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_only_given_fields() {
        let base = CacheConfig::new().with_stale_time(Duration::from_secs(1));
        let args = DemoArgs {
            latency_ms: 300,
            fail_background: false,
            stale_ms: None,
            gc_ms: Some(250),
        };

        let config = args.cache_config(base);
        assert_eq!(config.stale_time, Duration::from_secs(1));
        assert_eq!(config.gc_time, Duration::from_millis(250));
        assert_eq!(config.first_fetch_grace, base.first_fetch_grace);
    }
}
