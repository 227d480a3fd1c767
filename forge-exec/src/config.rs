//! Orchestrator configuration
//!
//! Defines all configurable parameters for a pipeline run including
//! polling and heartbeat cadence, parallelism and result handling.

use std::time::Duration;

/// Orchestrator configuration
///
/// All intervals are configurable to allow tuning for different
/// deployment scenarios (dev vs prod, fast vs slow executors).
#[derive(Debug, Clone)]
pub struct Config {
    /// How often to poll the executor for job status/output
    pub poll_interval: Duration,

    /// How often to refresh the run's liveness heartbeat. Must be
    /// shorter than `poll_interval` so a dead run is detected promptly.
    pub heartbeat_interval: Duration,

    /// Clear intermediate port data and reset job statuses before
    /// starting the run
    pub reset_results: bool,

    /// Max remote jobs watched concurrently
    pub max_parallel_jobs: usize,

    /// Keep the executor's all-files result artifacts for debugging
    pub debug_artifacts: bool,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            heartbeat_interval: Duration::from_millis(1000),
            reset_results: true,
            max_parallel_jobs: 2,
            debug_artifacts: false,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - FORGE_POLL_INTERVAL_MS (optional, default: 1500)
    /// - FORGE_HEARTBEAT_INTERVAL_MS (optional, default: 1000)
    /// - FORGE_MAX_PARALLEL_JOBS (optional, default: 2)
    /// - FORGE_DEBUG_ARTIFACTS (optional, default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::new();

        if let Some(ms) = read_env_u64("FORGE_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = read_env_u64("FORGE_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Some(n) = read_env_u64("FORGE_MAX_PARALLEL_JOBS") {
            config.max_parallel_jobs = n as usize;
        }

        config.debug_artifacts = std::env::var("FORGE_DEBUG_ARTIFACTS")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        config.validate()?;
        Ok(config)
    }

    /// Sets the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets whether prior results are cleared before the run
    pub fn with_reset_results(mut self, reset: bool) -> Self {
        self.reset_results = reset;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.heartbeat_interval >= self.poll_interval {
            anyhow::bail!("heartbeat_interval must be shorter than poll_interval");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn read_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1000));
        assert!(config.reset_results);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        // Zero poll interval should fail
        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        // Heartbeat slower than polling should fail
        config.poll_interval = Duration::from_millis(1000);
        config.heartbeat_interval = Duration::from_millis(2500);
        assert!(config.validate().is_err());
    }
}
