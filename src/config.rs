//! Process configuration for the Identity Reconciliation Engine.
//!
//! Loaded from environment variables with the defaults spec.md fixes
//! explicitly (retry cap 5, lock timeout 30s); everything else defaults to
//! values reasonable for local development.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_retry_cap() -> u32 {
    5
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_worker_count() -> usize {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_retry_max_delay_ms() -> u64 {
    1_600
}

/// Engine-wide configuration (spec.md §6, "Administrative surface" and
/// §4.3/§5's retry-cap and lock-timeout defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database_url: String,

    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Build from environment variables: `IRE_DATABASE_URL` (required),
    /// `IRE_RETRY_CAP`, `IRE_LOCK_TIMEOUT_MS`, `IRE_WORKER_COUNT`,
    /// `IRE_RETRY_BASE_DELAY_MS`, `IRE_RETRY_MAX_DELAY_MS` (all optional).
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("IRE_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("IRE_DATABASE_URL must be set"))?;

        let retry_cap = env_parsed_or("IRE_RETRY_CAP", default_retry_cap());
        let lock_timeout_ms = env_parsed_or("IRE_LOCK_TIMEOUT_MS", default_lock_timeout_ms());
        let worker_count = env_parsed_or("IRE_WORKER_COUNT", default_worker_count());
        let retry_base_delay_ms =
            env_parsed_or("IRE_RETRY_BASE_DELAY_MS", default_retry_base_delay_ms());
        let retry_max_delay_ms =
            env_parsed_or("IRE_RETRY_MAX_DELAY_MS", default_retry_max_delay_ms());

        Ok(Self {
            database_url,
            retry_cap,
            lock_timeout_ms,
            worker_count,
            retry_base_delay_ms,
            retry_max_delay_ms,
        })
    }
}

fn env_parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Construct directly rather than through from_env to avoid touching
        // process-wide environment state in a parallel test run.
        let cfg = EngineConfig {
            database_url: "postgres://localhost/test".to_string(),
            retry_cap: default_retry_cap(),
            lock_timeout_ms: default_lock_timeout_ms(),
            worker_count: default_worker_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        };
        assert_eq!(cfg.retry_cap, 5);
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(30));
    }
}
