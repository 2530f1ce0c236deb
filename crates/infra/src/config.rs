//! Runtime configuration for the digest runner, cleanup and scheduler.
//!
//! Every struct has sensible defaults; [`WorkerConfig::from_env`] overlays
//! `LOYALTYSYNC_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use loyaltysync_core::RetryPolicy;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Digest runner configuration.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    /// Maximum jobs selected per cycle
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Disable the retry gate entirely
    pub skip_retry_gate: bool,
    /// How deep corrective jobs may spawn further corrective jobs
    pub max_repair_depth: u32,
    /// Source tag for corrective jobs that do not name one
    pub repair_source_id: String,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            retry: RetryPolicy::default(),
            skip_retry_gate: false,
            max_repair_depth: 1,
            repair_source_id: "repair".to_string(),
        }
    }
}

impl DigestConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_skip_retry_gate(mut self, skip: bool) -> Self {
        self.skip_retry_gate = skip;
        self
    }

    pub fn with_max_repair_depth(mut self, depth: u32) -> Self {
        self.max_repair_depth = depth;
        self
    }
}

/// Cleanup of old completed jobs.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Completed jobs untouched for longer than this are deleted
    pub retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Periodic trigger configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between digest cycles
    pub interval: Duration,
    /// Run cleanup every N cycles (0 disables it)
    pub cleanup_every: u32,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            cleanup_every: 60,
            name: "loyaltysync-digest".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cleanup_every(mut self, cycles: u32) -> Self {
        self.cleanup_every = cycles;
        self
    }
}

/// Everything a worker process needs.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub digest: DigestConfig,
    pub cleanup: CleanupConfig,
    pub scheduler: SchedulerConfig,
}

impl WorkerConfig {
    /// Defaults overlaid with `LOYALTYSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = parse::<usize>(&lookup, "LOYALTYSYNC_BATCH_SIZE")? {
            if v == 0 {
                return Err(invalid("LOYALTYSYNC_BATCH_SIZE", "0", "must be positive"));
            }
            cfg.digest.batch_size = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "LOYALTYSYNC_MAX_RETRIES")? {
            cfg.digest.retry.max_retries = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "LOYALTYSYNC_BACKOFF_HOURS")? {
            cfg.digest.retry.step = Duration::from_secs(v * 60 * 60);
        }
        if let Some(v) = parse_bool(&lookup, "LOYALTYSYNC_SKIP_RETRY_GATE")? {
            cfg.digest.skip_retry_gate = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "LOYALTYSYNC_RETENTION_DAYS")? {
            cfg.cleanup.retention = Duration::from_secs(v * 24 * 60 * 60);
        }
        if let Some(v) = parse::<u64>(&lookup, "LOYALTYSYNC_INTERVAL_SECS")? {
            if v == 0 {
                return Err(invalid("LOYALTYSYNC_INTERVAL_SECS", "0", "must be positive"));
            }
            cfg.scheduler.interval = Duration::from_secs(v);
        }

        Ok(cfg)
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, e.to_string())),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.digest.batch_size, 500);
        assert_eq!(cfg.digest.retry.max_retries, 8);
        assert_eq!(cfg.digest.retry.step, Duration::from_secs(7200));
        assert!(!cfg.digest.skip_retry_gate);
        assert_eq!(cfg.scheduler.interval, Duration::from_secs(60));
    }

    #[test]
    fn env_values_override_defaults() {
        let cfg = WorkerConfig::from_lookup(lookup(&[
            ("LOYALTYSYNC_BATCH_SIZE", "50"),
            ("LOYALTYSYNC_MAX_RETRIES", "3"),
            ("LOYALTYSYNC_BACKOFF_HOURS", "1"),
            ("LOYALTYSYNC_SKIP_RETRY_GATE", "yes"),
            ("LOYALTYSYNC_RETENTION_DAYS", "7"),
            ("LOYALTYSYNC_INTERVAL_SECS", "300"),
        ]))
        .unwrap();
        assert_eq!(cfg.digest.batch_size, 50);
        assert_eq!(cfg.digest.retry.max_retries, 3);
        assert_eq!(cfg.digest.retry.step, Duration::from_secs(3600));
        assert!(cfg.digest.skip_retry_gate);
        assert_eq!(cfg.cleanup.retention, Duration::from_secs(7 * 86400));
        assert_eq!(cfg.scheduler.interval, Duration::from_secs(300));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = WorkerConfig::from_lookup(lookup(&[("LOYALTYSYNC_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "LOYALTYSYNC_BATCH_SIZE"));

        assert!(WorkerConfig::from_lookup(lookup(&[("LOYALTYSYNC_BATCH_SIZE", "0")])).is_err());
        assert!(WorkerConfig::from_lookup(lookup(&[("LOYALTYSYNC_SKIP_RETRY_GATE", "maybe")])).is_err());
    }
}
