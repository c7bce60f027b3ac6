use chrono::Duration;

use crate::error::{QueueError, Result};
use crate::jobs::kind::QueueKindName;
use crate::jobs::{QueueSettings, RetryPolicy};

/// Longest lease a worker may ask for (1 day).
pub const MAX_LEASE_TTL_SECS: i64 = 24 * 60 * 60;

/// Connection pool sizing for [`crate::db::make_pool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: std::time::Duration,
    /// Runs `SET jit = OFF` on every new connection.
    pub disable_jit: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

impl PoolSettings {
    /// Unset values take the defaults (4 connections, 10 s, JIT off); set
    /// values are clamped to 1..=32 connections and 1..=60 s.
    pub fn new(
        max_connections: Option<u32>,
        acquire_timeout_secs: Option<u64>,
        disable_jit: Option<bool>,
    ) -> Self {
        Self {
            max_connections: max_connections.unwrap_or(4).clamp(1, 32),
            acquire_timeout: std::time::Duration::from_secs(
                acquire_timeout_secs.unwrap_or(10).clamp(1, 60),
            ),
            disable_jit: disable_jit.unwrap_or(true),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            env_parse("LEASEFLOW_DB_MAX_CONNECTIONS"),
            env_parse("LEASEFLOW_DB_ACQUIRE_TIMEOUT_SECS"),
            env_bool("LEASEFLOW_DISABLE_JIT"),
        )
    }
}

/// Worker runtime configuration, read from the environment.
///
/// Prefixed `LEASEFLOW_*` variables win; the unprefixed names are accepted as
/// fallbacks for container setups that already export them.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub queue: QueueKindName,
    pub claim_limit: i64,
    /// Overrides the kind's default lease TTL when set.
    pub lease_ttl_secs: Option<i64>,
    pub poll_interval_ms: u64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub pull_job_types: Vec<String>,
    pub retry: RetryPolicy,
    pub pool: PoolSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| QueueError::Config("DATABASE_URL is missing".into()))?;

        let worker_id = env_or_fallback("LEASEFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let queue = env_or_fallback("LEASEFLOW_QUEUE", "QUEUE")
            .map(|s| s.parse::<QueueKindName>())
            .transpose()?
            .unwrap_or(QueueKindName::Exchange);

        let claim_limit = env_parse("LEASEFLOW_CLAIM_LIMIT")
            .unwrap_or(10_i64)
            .clamp(1, 1_000);

        let lease_ttl_secs = check_lease_ttl(env_parse("LEASEFLOW_LEASE_TTL_SECS"))?;

        let poll_interval_ms = env_parse("LEASEFLOW_POLL_INTERVAL_MS").unwrap_or(500_u64);

        let admin_addr = std::env::var("LEASEFLOW_ADMIN_ADDR")
            .ok()
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("LEASEFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let pull_job_types = std::env::var("LEASEFLOW_PULL_JOB_TYPES")
            .map(|s| split_list(&s))
            .unwrap_or_default();

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            base_seconds: env_parse("LEASEFLOW_RETRY_BASE_SECS").unwrap_or(defaults.base_seconds),
            max_seconds: env_parse("LEASEFLOW_RETRY_MAX_SECS").unwrap_or(defaults.max_seconds),
            jitter_pct: env_parse("LEASEFLOW_RETRY_JITTER_PCT").unwrap_or(defaults.jitter_pct),
        };
        retry.validate()?;

        Ok(Self {
            database_url,
            worker_id,
            queue,
            claim_limit,
            lease_ttl_secs,
            poll_interval_ms,
            admin_addr,
            migrate_on_startup,
            pull_job_types,
            retry,
            pool: PoolSettings::from_env(),
        })
    }

    /// Settings for the configured kind, with env overrides applied.
    pub fn queue_settings(&self) -> QueueSettings {
        let ttl = self
            .lease_ttl_secs
            .unwrap_or_else(|| self.queue.default_lease_ttl_secs());

        QueueSettings {
            lease_ttl: Duration::seconds(ttl),
            retry: self.retry.clone(),
            job_types: self.pull_job_types.clone(),
        }
    }
}

fn check_lease_ttl(secs: Option<i64>) -> Result<Option<i64>> {
    match secs {
        Some(s) if !(1..=MAX_LEASE_TTL_SECS).contains(&s) => Err(QueueError::Config(format!(
            "LEASEFLOW_LEASE_TTL_SECS must be within 1..={MAX_LEASE_TTL_SECS}, got {s}"
        ))),
        other => Ok(other),
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
