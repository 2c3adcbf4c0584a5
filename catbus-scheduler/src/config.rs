//! Scheduler configuration.

use crate::error::{SchedulerError, SchedulerResult};
use catbus_config::EnvLoader;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Where pending jobs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceMode {
    /// In process memory; lost on restart
    #[default]
    Transient,

    /// In Redis; resumed when the scheduler starts again
    Persisted,
}

impl FromStr for PersistenceMode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "transient" | "memory" => Ok(PersistenceMode::Transient),
            "persisted" | "redis" => Ok(PersistenceMode::Persisted),
            other => Err(SchedulerError::Config(format!(
                "unknown persistence mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceMode::Transient => f.write_str("transient"),
            PersistenceMode::Persisted => f.write_str("persisted"),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of handlers running at once
    pub workers: usize,

    /// Job persistence
    pub mode: PersistenceMode,

    /// Redis URL for persisted mode
    pub redis_url: String,

    /// Key prefix for persisted mode
    pub key_prefix: String,

    /// Longest the timer sleeps without re-reading the store
    pub poll_interval: Duration,

    /// How long `stop` waits for in-flight handlers
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            mode: PersistenceMode::Transient,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "catbus:scheduler".to_string(),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Environment variable prefix.
    pub const ENV_PREFIX: &'static str = "CATBUS_SCHEDULER";

    /// Load from `CATBUS_SCHEDULER_*` environment variables.
    pub fn from_env() -> SchedulerResult<Self> {
        Self::from_loader(&EnvLoader::with_prefix(Self::ENV_PREFIX))
    }

    /// Load through an explicit loader.
    pub fn from_loader(loader: &EnvLoader) -> SchedulerResult<Self> {
        let defaults = Self::default();

        let config = Self {
            workers: loader.load_parsed_or("workers", defaults.workers)?,
            mode: match loader.load_var("mode") {
                Ok(raw) => raw.parse()?,
                Err(_) => defaults.mode,
            },
            redis_url: loader.load_var_or("redis_url", &defaults.redis_url),
            key_prefix: loader.load_var_or("key_prefix", &defaults.key_prefix),
            poll_interval: Duration::from_millis(
                loader.load_parsed_or("poll_interval_ms", defaults.poll_interval.as_millis() as u64)?,
            ),
            shutdown_timeout: Duration::from_secs(
                loader.load_parsed_or("shutdown_timeout_secs", defaults.shutdown_timeout.as_secs())?,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the persistence mode.
    pub fn with_mode(mut self, mode: PersistenceMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the timer poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check the configuration for values the scheduler cannot run with.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.workers == 0 {
            return Err(SchedulerError::Config("workers must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::Config(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.mode == PersistenceMode::Persisted && self.redis_url.is_empty() {
            return Err(SchedulerError::Config(
                "persisted mode needs a Redis URL".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn loader(vars: &[(&str, &str)]) -> EnvLoader {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvLoader::from_map(Some(SchedulerConfig::ENV_PREFIX.to_string()), map)
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::from_loader(&loader(&[])).unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.mode, PersistenceMode::Transient);
        assert_eq!(config.key_prefix, "catbus:scheduler");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_from_env_vars() {
        let config = SchedulerConfig::from_loader(&loader(&[
            ("CATBUS_SCHEDULER_WORKERS", "2"),
            ("CATBUS_SCHEDULER_MODE", "Persisted"),
            ("CATBUS_SCHEDULER_REDIS_URL", "redis://cache:6379"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.mode, PersistenceMode::Persisted);
        assert_eq!(config.redis_url, "redis://cache:6379");
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = SchedulerConfig::from_loader(&loader(&[("CATBUS_SCHEDULER_MODE", "disk")]));
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let result = SchedulerConfig::from_loader(&loader(&[("CATBUS_SCHEDULER_WORKERS", "0")]));
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[test]
    fn test_mode_display_round_trips() {
        for mode in [PersistenceMode::Transient, PersistenceMode::Persisted] {
            assert_eq!(mode.to_string().parse::<PersistenceMode>().unwrap(), mode);
        }
    }
}
