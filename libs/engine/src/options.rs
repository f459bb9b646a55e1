//! Per-operation options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::relay::ErrorRecord;
use crate::retry::RetryPolicy;

/// Callback invoked with every terminal failure of an operation.
pub type ErrorCallback = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

/// Predicate deciding whether a failure stays out of the global relay.
pub type SuppressPredicate = Arc<dyn Fn(&ErrorRecord) -> bool + Send + Sync>;

/// Error reporting hooks shared by all operation kinds.
#[derive(Clone, Default)]
pub struct ErrorHooks {
    pub on_error: Option<ErrorCallback>,
    pub should_suppress_error_relay: Option<SuppressPredicate>,
}

impl fmt::Debug for ErrorHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHooks")
            .field("on_error", &self.on_error.is_some())
            .field(
                "should_suppress_error_relay",
                &self.should_suppress_error_relay.is_some(),
            )
            .finish()
    }
}

/// Options for a query actor.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub gc_time: Option<Duration>,
    pub retry: RetryPolicy,
    /// Drop `fetch` commands whose revision is no longer current.
    pub is_strict_mode: bool,
    pub mailbox_size: usize,
    pub hooks: ErrorHooks,
}

impl QueryOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            stale_time: config.stale_time,
            gc_time: config.gc_time,
            retry: config.retry.clone(),
            is_strict_mode: config.is_strict_mode,
            mailbox_size: config.mailbox_size,
            hooks: ErrorHooks::default(),
        }
    }
}

/// Options for a mutation actor.
#[derive(Debug, Clone)]
pub struct MutationOptions {
    pub gc_time: Option<Duration>,
    pub retry: RetryPolicy,
    /// After one successful mutation, further mutate calls are no-ops until reset.
    pub is_one_shot: bool,
    /// Reject a mutate whose captured revision is no longer current.
    pub is_strict_mode: bool,
    /// Await the cache-update and effect hooks before publishing success.
    pub should_execute_effect_synchronously: bool,
    pub mailbox_size: usize,
    pub hooks: ErrorHooks,
}

impl MutationOptions {
    /// Mutations are not idempotent, so the client's retry budget is not
    /// inherited; only its backoff shape is.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            gc_time: config.gc_time,
            retry: RetryPolicy {
                max_retries: 0,
                ..config.retry.clone()
            },
            is_one_shot: false,
            is_strict_mode: config.is_strict_mode,
            should_execute_effect_synchronously: config.should_execute_effect_synchronously,
            mailbox_size: config.mailbox_size,
            hooks: ErrorHooks::default(),
        }
    }
}

/// Options for a subscription actor.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub gc_time: Option<Duration>,
    pub mailbox_size: usize,
    pub hooks: ErrorHooks,
}

impl SubscriptionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            gc_time: config.gc_time,
            mailbox_size: config.mailbox_size,
            hooks: ErrorHooks::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_options_do_not_retry_by_default() {
        let options = MutationOptions::from_config(&ClientConfig::default());
        assert_eq!(options.retry.max_retries, 0);
        assert!(!options.is_one_shot);
    }

    #[test]
    fn test_query_options_inherit_config() {
        let config = ClientConfig {
            stale_time: Duration::from_secs(30),
            is_strict_mode: true,
            ..ClientConfig::default()
        };
        let options = QueryOptions::from_config(&config);
        assert_eq!(options.stale_time, Duration::from_secs(30));
        assert!(options.is_strict_mode);
        assert_eq!(options.retry.max_retries, 3);
    }
}
