//! Recovery policies for samplers and supervised units.
//!
//! Instrument errors are absorbed by the sampler: it counts consecutive poll
//! failures and reconnects once [`ReconnectPolicy::threshold`] is reached. When
//! reconnecting itself fails [`ReconnectPolicy::max_attempts`] times in a row
//! the unit gives up with [`crate::error::DaqError::Degraded`], and the
//! orchestrator applies the [`RestartPolicy`].

use crate::config::DaemonConfig;
use std::time::Duration;

/// When a sampler reconnects and when it gives up.
///
/// # Example
///
/// ```rust
/// use station_daq::error_recovery::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::default();
/// assert_eq!(policy.threshold, 3);
/// assert_eq!(policy.max_attempts, 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive poll failures that trigger a reconnect.
    pub threshold: u32,
    /// Consecutive failed connect attempts before the unit is degraded.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            max_attempts: 5,
        }
    }
}

impl From<&DaemonConfig> for ReconnectPolicy {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            threshold: config.reconnect_threshold.max(1),
            max_attempts: config.max_reconnect_attempts.max(1),
        }
    }
}

/// How the orchestrator restarts a unit that stopped with an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before restarting.
    pub delay: Duration,
    /// Maximum number of restarts; unbounded when `None`.
    pub max_restarts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            max_restarts: None,
        }
    }
}

impl From<&DaemonConfig> for RestartPolicy {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            delay: config.restart_delay,
            max_restarts: config.max_restarts,
        }
    }
}

impl RestartPolicy {
    /// Whether another restart is allowed after `restarts` restarts so far.
    pub fn allows(&self, restarts: u32) -> bool {
        self.max_restarts.map_or(true, |max| restarts < max)
    }
}

/// Counter of consecutive failures against a threshold.
#[derive(Clone, Debug, Default)]
pub struct FailureStreak {
    count: u32,
}

impl FailureStreak {
    /// Record a failure; returns the new streak length.
    pub fn fail(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    /// Reset the streak after a success.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Current streak length.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the streak has reached `threshold`.
    pub fn reached(&self, threshold: u32) -> bool {
        self.count >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_limits() {
        let unbounded = RestartPolicy::default();
        assert!(unbounded.allows(10_000));

        let limited = RestartPolicy {
            delay: Duration::from_secs(1),
            max_restarts: Some(2),
        };
        assert!(limited.allows(0));
        assert!(limited.allows(1));
        assert!(!limited.allows(2));
    }

    #[test]
    fn failure_streak() {
        let mut streak = FailureStreak::default();
        assert_eq!(streak.fail(), 1);
        assert_eq!(streak.fail(), 2);
        assert!(!streak.reached(3));
        streak.fail();
        assert!(streak.reached(3));
        streak.reset();
        assert_eq!(streak.count(), 0);
    }

    #[test]
    fn policies_from_daemon_config() {
        let mut config = DaemonConfig::default();
        config.reconnect_threshold = 0;
        config.max_restarts = Some(4);
        assert_eq!(ReconnectPolicy::from(&config).threshold, 1);
        assert_eq!(RestartPolicy::from(&config).max_restarts, Some(4));
    }
}
