//! Engine configuration.

use std::time::Duration;

use tracing::warn;

use bulkmsg_messaging::BatchSize;

use crate::queue::RetryPolicy;

/// Tunables for dispatch and execution.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Recipients per batch unit.
    pub batch_size: BatchSize,
    /// Largest recipient set accepted at creation, 0 for unlimited.
    pub max_recipients: usize,
    /// Worker loops pulling from the task queue.
    pub workers: usize,
    /// Idle delay between queue polls.
    pub poll_interval: Duration,
    /// Retry policy attached to every dispatched unit.
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: BatchSize::default(),
            max_recipients: 0,
            workers: 4,
            poll_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `BULKMSG_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `BULKMSG_BATCH_SIZE` | `batch_size` (values below 1 fall back to 50) |
    /// | `BULKMSG_MAX_RECIPIENTS` | `max_recipients` |
    /// | `BULKMSG_WORKERS` | `workers` |
    /// | `BULKMSG_POLL_INTERVAL_MS` | `poll_interval` |
    /// | `BULKMSG_MAX_ATTEMPTS` | `retry_policy.max_attempts` |
    /// | `BULKMSG_RETRY_BASE_MS` | `retry_policy.base_delay` |
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(size) = parse::<i64>(&lookup, "BULKMSG_BATCH_SIZE") {
            config.batch_size = BatchSize::or_default(size);
        }
        if let Some(max) = parse::<usize>(&lookup, "BULKMSG_MAX_RECIPIENTS") {
            config.max_recipients = max;
        }
        if let Some(workers) = parse::<usize>(&lookup, "BULKMSG_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(ms) = parse::<u64>(&lookup, "BULKMSG_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse::<u32>(&lookup, "BULKMSG_MAX_ATTEMPTS") {
            config.retry_policy.max_attempts = attempts.max(1);
        }
        if let Some(ms) = parse::<u64>(&lookup, "BULKMSG_RETRY_BASE_MS") {
            config.retry_policy.base_delay = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_batch_size(mut self, size: BatchSize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_recipients(mut self, max: usize) -> Self {
        self.max_recipients = max;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Whether `count` recipients exceed the creation limit.
    pub fn exceeds_max_recipients(&self, count: usize) -> bool {
        self.max_recipients > 0 && count > self.max_recipients
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring malformed configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> EngineConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]);
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.batch_size.get(), 50);
        assert_eq!(config.max_recipients, 0);
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("BULKMSG_BATCH_SIZE", "25"),
            ("BULKMSG_MAX_RECIPIENTS", "1000"),
            ("BULKMSG_WORKERS", "2"),
            ("BULKMSG_POLL_INTERVAL_MS", "20"),
            ("BULKMSG_MAX_ATTEMPTS", "3"),
        ]);
        assert_eq!(config.batch_size.get(), 25);
        assert_eq!(config.max_recipients, 1000);
        assert_eq!(config.workers, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.retry_policy.max_attempts, 3);
    }

    #[test]
    fn non_positive_batch_size_falls_back_and_garbage_is_ignored() {
        let config = config_from(&[("BULKMSG_BATCH_SIZE", "0"), ("BULKMSG_WORKERS", "many")]);
        assert_eq!(config.batch_size.get(), 50);
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn zero_max_recipients_is_unlimited() {
        let config = EngineConfig::default();
        assert!(!config.exceeds_max_recipients(1_000_000));
        let limited = config.with_max_recipients(100);
        assert!(!limited.exceeds_max_recipients(100));
        assert!(limited.exceeds_max_recipients(101));
    }
}
