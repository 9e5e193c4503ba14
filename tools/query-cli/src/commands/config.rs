//! Configuration management commands.

use std::fs;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};

use super::{ConfigArgs, ConfigCommand};
use crate::config::{generate_default_config, FetchConfig};
use crate::context::Context;
use crate::output::format_duration;

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => show_config(ctx),
        ConfigCommand::Init { force } => init_config(force, ctx),
        ConfigCommand::Validate => validate_config(ctx),
    }
}

fn show_config(ctx: &Context) -> Result<()> {
    if ctx.output.is_json() {
        ctx.output.json(&ctx.config);
        return Ok(());
    }

    ctx.output.header("Current Configuration");
    match ctx.config_path {
        Some(ref path) => ctx.output.kv("source", &path.display().to_string()),
        None => ctx.output.kv("source", "built-in defaults"),
    }

    let cache = &ctx.config.cache;
    ctx.output.info("");
    ctx.output.info("[cache]");
    ctx.output.kv("stale_time", &format_duration(cache.stale_time));
    ctx.output.kv("gc_time", &format_duration(cache.gc_time));
    ctx.output.kv("first_fetch_grace", &format_duration(cache.first_fetch_grace));

    let policy = ctx.config.fetch.policy();
    ctx.output.info("");
    ctx.output.info("[fetch]");
    ctx.output.kv("max_retries", &policy.retry.max_retries.to_string());
    ctx.output.kv("backoff", &format!("{:?}", policy.retry.backoff));
    ctx.output.kv("attempt_timeout", &format_duration(policy.timeout.attempt));
    ctx.output.kv("total_timeout", &format_duration(policy.timeout.total));

    Ok(())
}

fn init_config(force: bool, ctx: &Context) -> Result<()> {
    let config_path = ctx.cwd.join("query.toml");

    if config_path.exists() && !force {
        bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    fs::write(&config_path, generate_default_config())
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

    ctx.output.success(&format!("Created: {}", config_path.display()));

    Ok(())
}

fn validate_config(ctx: &Context) -> Result<()> {
    ctx.output.header("Validating configuration");

    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    let cache = &ctx.config.cache;
    if cache.gc_time.is_zero() {
        warnings.push("cache.gc_time_ms is 0; unobserved queries are dropped immediately".to_string());
    }
    if cache.first_fetch_grace > cache.stale_time && !cache.stale_time.is_zero() {
        warnings.push(format!(
            "cache.first_fetch_grace_ms ({}) exceeds cache.stale_time_ms ({})",
            format_duration(cache.first_fetch_grace),
            format_duration(cache.stale_time)
        ));
    }

    let fetch = &ctx.config.fetch;
    if fetch.attempt_timeout_ms == 0 || fetch.total_timeout_ms == 0 {
        errors.push("fetch timeouts must be greater than 0".to_string());
    }
    if fetch.attempt_timeout_ms > fetch.total_timeout_ms {
        errors.push("fetch.attempt_timeout_ms must not exceed fetch.total_timeout_ms".to_string());
    }
    let worst_case = worst_case_ms(fetch);
    if fetch.total_timeout_ms < worst_case {
        warnings.push(format!(
            "fetch.total_timeout_ms may cut retries short ({} attempts of up to {}ms plus backoff, {} in total)",
            fetch.max_retries + 1,
            fetch.attempt_timeout_ms,
            format_duration(Duration::from_millis(worst_case))
        ));
    }

    // Print results
    if errors.is_empty() && warnings.is_empty() {
        ctx.output.success("Configuration is valid");
        return Ok(());
    }

    for error in &errors {
        ctx.output.error(&format!("Error: {}", error));
    }

    for warning in &warnings {
        ctx.output.warn(&format!("Warning: {}", warning));
    }

    if !errors.is_empty() {
        bail!("Configuration has {} error(s)", errors.len());
    }

    ctx.output.success("Configuration is valid (with warnings)");

    Ok(())
}

/// Longest a fetch can run when every attempt times out: all attempts plus
/// the backoff delays between them.
fn worst_case_ms(fetch: &FetchConfig) -> u64 {
    let backoff = fetch.policy().retry.backoff;
    let delays: Duration = (0..fetch.max_retries)
        .map(|attempt| backoff.delay_for_attempt(attempt))
        .sum();
    let delays = u64::try_from(delays.as_millis()).unwrap_or(u64::MAX);

    fetch
        .attempt_timeout_ms
        .saturating_mul(u64::from(fetch.max_retries) + 1)
        .saturating_add(delays)
}
