//! Connection state machine and health results

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Lifecycle of the supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A connect attempt holds the connection lock
    Connecting,
    /// Connected and probed at least once since `since`
    Connected { since: Instant },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn connected_since(&self) -> Option<Instant> {
        match self {
            ConnectionState::Connected { since } => Some(*since),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected { .. } => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a health check came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthReason {
    Responsive,
    Timeout,
    TransportError,
    Stale,
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub ok: bool,
    pub reason: HealthReason,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            reason: HealthReason::Responsive,
        }
    }

    pub fn failed(reason: HealthReason) -> Self {
        Self { ok: false, reason }
    }
}

/// Snapshot of supervisor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub scans: u64,
    pub connect_attempts: u64,
    pub successful_connects: u64,
    pub forced_resets: u64,
    pub health_checks: u64,
    pub monitor_restarts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub scans: AtomicU64,
    pub connect_attempts: AtomicU64,
    pub successful_connects: AtomicU64,
    pub forced_resets: AtomicU64,
    pub health_checks: AtomicU64,
    pub monitor_restarts: AtomicU64,
}

impl StatCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            scans: self.scans.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            successful_connects: self.successful_connects.load(Ordering::Relaxed),
            forced_resets: self.forced_resets.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            monitor_restarts: self.monitor_restarts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_connected_since_only_when_connected() {
        let now = Instant::now();
        assert_eq!(ConnectionState::Disconnected.connected_since(), None);
        assert_eq!(ConnectionState::Connecting.connected_since(), None);
        assert_eq!(
            ConnectionState::Connected { since: now }.connected_since(),
            Some(now)
        );
        assert!(!ConnectionState::Connecting.is_connected());
    }

    #[test]
    fn test_health_result_serializes() {
        let json = serde_json::to_string(&HealthCheckResult::failed(HealthReason::TransportError))
            .unwrap();
        assert_eq!(json, r#"{"ok":false,"reason":"transport_error"}"#);
    }

    #[test]
    fn test_stats_snapshot() {
        let counters = StatCounters::default();
        StatCounters::bump(&counters.scans);
        StatCounters::bump(&counters.scans);
        StatCounters::bump(&counters.forced_resets);

        let stats = counters.snapshot();
        assert_eq!(stats.scans, 2);
        assert_eq!(stats.forced_resets, 1);
        assert_eq!(stats.connect_attempts, 0);
    }
}
