//! Environment-driven configuration for the reconciler.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::workers::WorkerConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Postgres ledger + Redis Streams instead of in-memory wiring
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub stream_prefix: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub shards: usize,
    /// Backoff before a failed delivery is handed back for redelivery
    pub redelivery: RetryPolicy,
    /// Per ledger operation
    pub store_timeout: Duration,
    /// Per publish call (transport socket timeout)
    pub publish_timeout: Duration,
    pub publish_retry: RetryPolicy,
    /// Pending entries idle longer than this are redelivered
    pub pending_idle: Duration,
    /// Idempotency markers older than this are pruned
    pub marker_retention: Duration,
    pub marker_prune_interval: Duration,
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let use_persistent_stores = parse(&get, "USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let shards: usize = parse(&get, "RECONCILER_SHARDS", 4)?;
        at_least_one("RECONCILER_SHARDS", shards as u64)?;

        let alert_after_attempts: u32 = parse(&get, "RECONCILER_ALERT_AFTER_ATTEMPTS", 10)?;
        at_least_one("RECONCILER_ALERT_AFTER_ATTEMPTS", alert_after_attempts as u64)?;

        let publish_max_attempts: u32 = parse(&get, "RECONCILER_PUBLISH_MAX_ATTEMPTS", 5)?;
        at_least_one("RECONCILER_PUBLISH_MAX_ATTEMPTS", publish_max_attempts as u64)?;

        let store_timeout = millis(&get, "RECONCILER_STORE_TIMEOUT_MS", 2_000)?;
        let publish_timeout = millis(&get, "RECONCILER_PUBLISH_TIMEOUT_MS", 2_000)?;
        let publish_base_delay = millis(&get, "RECONCILER_PUBLISH_BASE_DELAY_MS", 50)?;
        let pending_idle = millis(&get, "RECONCILER_PENDING_IDLE_MS", 30_000)?;
        let redelivery_base_delay = millis(&get, "RECONCILER_REDELIVERY_BASE_DELAY_MS", 100)?;
        let redelivery_max_delay = millis(&get, "RECONCILER_REDELIVERY_MAX_DELAY_MS", 5_000)?;
        if redelivery_max_delay < redelivery_base_delay {
            return Err(ConfigError::Invalid {
                key: "RECONCILER_REDELIVERY_MAX_DELAY_MS",
                value: redelivery_max_delay.as_millis().to_string(),
                reason: "must not be below RECONCILER_REDELIVERY_BASE_DELAY_MS".to_string(),
            });
        }

        let retention_hours: u64 = parse(&get, "RECONCILER_MARKER_RETENTION_HOURS", 168)?;
        at_least_one("RECONCILER_MARKER_RETENTION_HOURS", retention_hours)?;
        let marker_retention = Duration::from_secs(retention_hours.saturating_mul(3_600));
        if marker_retention <= pending_idle {
            return Err(ConfigError::Invalid {
                key: "RECONCILER_MARKER_RETENTION_HOURS",
                value: retention_hours.to_string(),
                reason: "must exceed RECONCILER_PENDING_IDLE_MS".to_string(),
            });
        }
        let prune_interval_secs: u64 = parse(&get, "RECONCILER_MARKER_PRUNE_INTERVAL_SECS", 3_600)?;
        at_least_one("RECONCILER_MARKER_PRUNE_INTERVAL_SECS", prune_interval_secs)?;

        Ok(Self {
            use_persistent_stores,
            database_url,
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            stream_prefix: get("REDIS_STREAM_PREFIX").unwrap_or_else(|| "stockflow".to_string()),
            consumer_group: get("RECONCILER_CONSUMER_GROUP").unwrap_or_else(|| "inventory.reconciler".to_string()),
            consumer_name: get("RECONCILER_CONSUMER_NAME")
                .unwrap_or_else(|| format!("reconciler-{}", uuid::Uuid::now_v7())),
            shards,
            redelivery: RetryPolicy::exponential(alert_after_attempts, redelivery_base_delay, redelivery_max_delay),
            store_timeout,
            publish_timeout,
            publish_retry: RetryPolicy::exponential(
                publish_max_attempts,
                publish_base_delay,
                publish_base_delay.saturating_mul(32),
            ),
            pending_idle,
            marker_retention,
            marker_prune_interval: Duration::from_secs(prune_interval_secs),
        })
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(self.consumer_name.clone())
            .with_shards(self.shards)
            .with_redelivery(self.redelivery.clone())
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn millis<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, key, default).map(Duration::from_millis)
}

fn at_least_one(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}
