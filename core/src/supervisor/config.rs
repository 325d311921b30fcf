//! Supervisor timing configuration

use std::time::Duration;

use super::SupervisorError;

/// Timeouts, intervals and retry limits for one supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Bound on a single transport connect
    pub connect_timeout: Duration,
    /// Bound on a single command or liveness probe
    pub command_timeout: Duration,
    /// Bound on a transport disconnect during reset
    pub disconnect_timeout: Duration,
    /// Health checks closer together than this return the previous result
    pub health_check_interval: Duration,
    /// Connections older than this are torn down even if healthy
    pub max_connection_age: Duration,
    /// First backoff delay; doubles per attempt
    pub backoff_base: Duration,
    /// Upper bound on a backoff delay
    pub backoff_cap: Duration,
    pub max_connect_attempts: u32,
    /// Minimum gap between monitor-driven connection attempts
    pub min_retry_gap: Duration,
    /// Bound on one discovery scan
    pub scan_timeout: Duration,
    /// How long a successful scan is trusted
    pub cache_ttl: Duration,
    /// Bound on the liveness probe `get_connection` runs on a live session
    pub fast_probe_timeout: Duration,
    /// Attempts per `get_connection` round while the scan cache is fresh
    pub quick_connect_attempts: u32,
    pub monitor_interval: Duration,
    /// Pause after a monitor cycle that failed
    pub monitor_error_interval: Duration,
    /// Delay before restarting a crashed monitor task
    pub restart_delay: Duration,
    /// Pause between `get_connection` rounds, clipped to the remaining budget
    pub retry_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            max_connection_age: Duration::from_secs(600),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            max_connect_attempts: 5,
            min_retry_gap: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(30),
            fast_probe_timeout: Duration::from_secs(2),
            quick_connect_attempts: 3,
            monitor_interval: Duration::from_secs(10),
            monitor_error_interval: Duration::from_secs(15),
            restart_delay: Duration::from_secs(1),
            retry_poll_interval: Duration::from_millis(500),
        }
    }
}

impl SupervisorConfig {
    /// Reject zero durations, zero attempt counts and inverted bounds
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("command_timeout", self.command_timeout),
            ("disconnect_timeout", self.disconnect_timeout),
            ("health_check_interval", self.health_check_interval),
            ("max_connection_age", self.max_connection_age),
            ("backoff_base", self.backoff_base),
            ("backoff_cap", self.backoff_cap),
            ("min_retry_gap", self.min_retry_gap),
            ("scan_timeout", self.scan_timeout),
            ("cache_ttl", self.cache_ttl),
            ("fast_probe_timeout", self.fast_probe_timeout),
            ("monitor_interval", self.monitor_interval),
            ("monitor_error_interval", self.monitor_error_interval),
            ("restart_delay", self.restart_delay),
            ("retry_poll_interval", self.retry_poll_interval),
        ];

        for (name, value) in durations {
            if value.is_zero() {
                return Err(SupervisorError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.max_connect_attempts == 0 {
            return Err(SupervisorError::InvalidConfig(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.quick_connect_attempts == 0 {
            return Err(SupervisorError::InvalidConfig(
                "quick_connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(SupervisorError::InvalidConfig(format!(
                "backoff_base ({:?}) exceeds backoff_cap ({:?})",
                self.backoff_base, self.backoff_cap
            )));
        }
        if self.fast_probe_timeout > self.command_timeout {
            return Err(SupervisorError::InvalidConfig(format!(
                "fast_probe_timeout ({:?}) exceeds command_timeout ({:?})",
                self.fast_probe_timeout, self.command_timeout
            )));
        }

        Ok(())
    }
}
