//! Controller configuration threaded into every reconciler.
//!
//! Durations live here rather than in constants so tests can shrink them
//! without touching production defaults.

use std::time::Duration;

use stratus_cloud::LimiterConfig;

/// Field manager recorded on every patch the operator makes
pub const FIELD_MANAGER: &str = "stratus-operator";

/// Timing policy of one resource kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageTimings {
    /// How long a condition may stay false before its failure is terminal
    pub stale_timeout: Duration,
    /// Delay before retrying after a retryable failure
    pub retry_delay: Duration,
    /// Deadline of one reconcile pass
    pub pass_timeout: Duration,
}

impl StageTimings {
    pub const fn new(stale_timeout: Duration, retry_delay: Duration, pass_timeout: Duration) -> Self {
        Self {
            stale_timeout,
            retry_delay,
            pass_timeout,
        }
    }
}

impl Default for StageTimings {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5 * 60),
            Duration::from_secs(10),
            Duration::from_secs(2 * 60),
        )
    }
}

/// Configuration of all controllers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub cluster: StageTimings,
    pub machine: StageTimings,
    pub vpc: StageTimings,
    pub firewall: StageTimings,
    pub bucket: StageTimings,
    pub key: StageTimings,
    /// Admission window for instance creation
    pub limiter: LimiterConfig,
    /// Requeue interval of a ready resource, for drift detection
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster: StageTimings::default(),
            // Instances boot slowly; give them longer before giving up
            machine: StageTimings::new(
                Duration::from_secs(10 * 60),
                Duration::from_secs(10),
                Duration::from_secs(2 * 60),
            ),
            vpc: StageTimings::default(),
            firewall: StageTimings::new(
                Duration::from_secs(5 * 60),
                Duration::from_secs(5),
                Duration::from_secs(60),
            ),
            bucket: StageTimings::default(),
            key: StageTimings::default(),
            limiter: LimiterConfig::default(),
            resync_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl ControllerConfig {
    /// Apply one stale timeout to every kind
    pub fn with_stale_timeout(mut self, stale_timeout: Duration) -> Self {
        for timings in self.timings_mut() {
            timings.stale_timeout = stale_timeout;
        }
        self
    }

    /// Apply one retry delay to every kind
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        for timings in self.timings_mut() {
            timings.retry_delay = retry_delay;
        }
        self
    }

    fn timings_mut(&mut self) -> [&mut StageTimings; 6] {
        [
            &mut self.cluster,
            &mut self.machine,
            &mut self.vpc,
            &mut self.firewall,
            &mut self.bucket,
            &mut self.key,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_minutes_to_stale_and_seconds_to_retry() {
        let config = ControllerConfig::default();
        assert_eq!(config.cluster.stale_timeout, Duration::from_secs(300));
        assert_eq!(config.machine.stale_timeout, Duration::from_secs(600));
        assert_eq!(config.firewall.retry_delay, Duration::from_secs(5));
        assert_eq!(config.limiter.ceiling, 10);
    }

    #[test]
    fn overrides_apply_to_every_kind() {
        let config = ControllerConfig::default()
            .with_stale_timeout(Duration::from_secs(1))
            .with_retry_delay(Duration::from_millis(10));
        for timings in [
            &config.cluster,
            &config.machine,
            &config.vpc,
            &config.firewall,
            &config.bucket,
            &config.key,
        ] {
            assert_eq!(timings.stale_timeout, Duration::from_secs(1));
            assert_eq!(timings.retry_delay, Duration::from_millis(10));
        }
    }
}
