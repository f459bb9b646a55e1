//! Client configuration.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::retry::RetryPolicy;

/// Engine-wide defaults. Per-operation options start from these and are then
/// refined by each key's `configure`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long an unreferenced entry stays cached. `None` keeps it forever.
    pub gc_time: Option<Duration>,

    /// How long fetched data counts as fresh.
    pub stale_time: Duration,

    /// Retry policy for queries. Mutations default to no retries.
    pub retry: RetryPolicy,

    /// Mailbox capacity per actor.
    pub mailbox_size: usize,

    /// Interval of the background GC sweep.
    pub gc_interval: Duration,

    /// Settle delay between a reconnect and resuming observed queries.
    pub network_resume_delay: Duration,

    /// Drop stale-revision fetch/mutate commands.
    pub is_strict_mode: bool,

    /// Await mutation effects before publishing success.
    pub should_execute_effect_synchronously: bool,

    /// Buffer size of the error relay.
    pub error_relay_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gc_time: Some(Duration::from_secs(5 * 60)),
            stale_time: Duration::ZERO,
            retry: RetryPolicy::default(),
            mailbox_size: 64,
            gc_interval: Duration::from_secs(60),
            network_resume_delay: Duration::from_secs(2),
            is_strict_mode: false,
            should_execute_effect_synchronously: false,
            error_relay_capacity: 128,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `QUARRY_GC_TIME_MS` | gc time; `0` or `never` disables eviction |
    /// | `QUARRY_STALE_TIME_MS` | stale time |
    /// | `QUARRY_MAX_RETRIES` | query retry budget |
    /// | `QUARRY_RETRY_BASE_MS` | first retry delay |
    /// | `QUARRY_RETRY_MULTIPLIER` | backoff multiplier |
    /// | `QUARRY_RETRY_MAX_MS` | backoff cap |
    /// | `QUARRY_MAILBOX_SIZE` | per-actor mailbox capacity |
    /// | `QUARRY_GC_INTERVAL_MS` | background sweep interval |
    /// | `QUARRY_NETWORK_RESUME_DELAY_MS` | reconnect settle delay |
    /// | `QUARRY_STRICT_MODE` | `true`/`false` |
    /// | `QUARRY_SYNC_EFFECTS` | `true`/`false` |
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let gc_time = match std::env::var("QUARRY_GC_TIME_MS") {
            Ok(raw) if raw == "never" || raw == "0" => None,
            Ok(raw) => Some(Duration::from_millis(
                raw.parse().context("QUARRY_GC_TIME_MS must be milliseconds")?,
            )),
            Err(_) => defaults.gc_time,
        };

        let retry = RetryPolicy {
            max_retries: env_parse("QUARRY_MAX_RETRIES")?.unwrap_or(defaults.retry.max_retries),
            base_delay: env_millis("QUARRY_RETRY_BASE_MS")?.unwrap_or(defaults.retry.base_delay),
            multiplier: env_parse("QUARRY_RETRY_MULTIPLIER")?
                .unwrap_or(defaults.retry.multiplier),
            max_delay: env_millis("QUARRY_RETRY_MAX_MS")?.unwrap_or(defaults.retry.max_delay),
            ..defaults.retry.clone()
        };

        Ok(Self {
            gc_time,
            stale_time: env_millis("QUARRY_STALE_TIME_MS")?.unwrap_or(defaults.stale_time),
            retry,
            mailbox_size: env_parse("QUARRY_MAILBOX_SIZE")?.unwrap_or(defaults.mailbox_size),
            gc_interval: env_millis("QUARRY_GC_INTERVAL_MS")?.unwrap_or(defaults.gc_interval),
            network_resume_delay: env_millis("QUARRY_NETWORK_RESUME_DELAY_MS")?
                .unwrap_or(defaults.network_resume_delay),
            is_strict_mode: env_parse("QUARRY_STRICT_MODE")?.unwrap_or(defaults.is_strict_mode),
            should_execute_effect_synchronously: env_parse("QUARRY_SYNC_EFFECTS")?
                .unwrap_or(defaults.should_execute_effect_synchronously),
            error_relay_capacity: defaults.error_relay_capacity,
        })
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}
