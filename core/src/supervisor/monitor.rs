//! Background monitor and its watchdog
//!
//! The monitor loop health-checks a live connection and reconnects a dead
//! one. It runs as its own task under a watchdog: if the loop panics, the
//! watchdog waits `restart_delay` and spawns it again. Stopping monitoring
//! flips a watch flag, which also cuts short the sleep between cycles.

use std::sync::{Arc, Weak};

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::state::StatCounters;
use super::ConnectionSupervisor;
use crate::peripheral::PeripheralError;

/// Decides whether the monitor may try to reconnect right now.
///
/// Explicit `get_connection` calls ignore the gate; it only throttles
/// opportunistic reconnects, e.g. to skip them while the host runs on
/// battery.
pub trait ConnectGate: Send + Sync {
    fn allows_attempt(&self) -> bool;
}

/// Gate that never objects
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAttempt;

impl ConnectGate for AlwaysAttempt {
    fn allows_attempt(&self) -> bool {
        true
    }
}

impl<F> ConnectGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn allows_attempt(&self) -> bool {
        self()
    }
}

impl ConnectionSupervisor {
    /// Start the background monitor. Calling it again while it runs is a no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        self.monitoring.send_replace(true);

        let mut watchdog = self.watchdog.lock();
        if watchdog.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Monitor for {} already running", self.address);
            return;
        }

        info!("Starting connection monitor for {}", self.address);
        *watchdog = Some(tokio::spawn(watchdog_task(Arc::downgrade(self))));
    }

    /// Ask the monitor to exit after its current cycle
    pub fn stop_monitoring(&self) {
        if self.monitoring.send_replace(false) {
            info!("Stopping connection monitor for {}", self.address);
        }
    }

    pub fn is_monitoring(&self) -> bool {
        *self.monitoring.borrow()
    }

    /// Run monitor cycles until monitoring is disabled
    pub async fn monitor_loop(self: Arc<Self>) {
        let mut enabled = self.monitoring.subscribe();
        debug!("Monitor loop running for {}", self.address);

        while *enabled.borrow_and_update() {
            let pause = match self.monitor_cycle().await {
                Ok(()) => self.config.monitor_interval,
                Err(e) => {
                    warn!("Monitor cycle for {} failed: {}", self.address, e);
                    self.config.monitor_error_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Monitor loop for {} exited", self.address);
    }

    /// One pass: check a live link, or reconnect a dead one when allowed
    async fn monitor_cycle(&self) -> Result<(), PeripheralError> {
        if self.is_connected() {
            let generation = self.client_generation();
            let health = self.health_check().await;
            if !health.ok && self.is_connected() {
                info!(
                    "Health check for {} failed ({:?}), disconnecting",
                    self.address, health.reason
                );
                self.disconnect_if(generation).await?;
            }
            return Ok(());
        }

        if !self.retry_gap_elapsed() {
            return Ok(());
        }
        if !self.gate.allows_attempt() {
            debug!("Connect gate closed, not reconnecting to {}", self.address);
            return Ok(());
        }

        if self.connect_with_backoff(self.config.max_connect_attempts).await {
            info!("Monitor reconnected to {}", self.address);
        }
        Ok(())
    }

    fn retry_gap_elapsed(&self) -> bool {
        match *self.last_attempt.lock() {
            Some(at) => Instant::now().saturating_duration_since(at) >= self.config.min_retry_gap,
            None => true,
        }
    }
}

/// Keeps a monitor loop alive, restarting it after a panic
async fn watchdog_task(supervisor: Weak<ConnectionSupervisor>) {
    loop {
        let Some(strong) = supervisor.upgrade() else {
            return;
        };
        if !strong.is_monitoring() {
            return;
        }

        let restart_delay = strong.config.restart_delay;
        let task = tokio::spawn(Arc::clone(&strong).monitor_loop());
        *strong.monitor_task.lock() = Some(task.abort_handle());
        drop(strong);

        match task.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                let Some(strong) = supervisor.upgrade() else {
                    return;
                };
                StatCounters::bump(&strong.counters.monitor_restarts);
                error!(
                    "Monitor loop for {} crashed, restarting in {:?}",
                    strong.address, restart_delay
                );
            }
            Err(_) => return,
        }

        tokio::time::sleep(restart_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::simulated::{SimulatedFactory, SimulatedTreadmill};
    use crate::peripheral::PeripheralAddress;
    use crate::supervisor::SupervisorConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn setup(gate_open: Arc<AtomicBool>) -> (Arc<SimulatedTreadmill>, Arc<ConnectionSupervisor>) {
        let device = SimulatedTreadmill::new(PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap());
        let factory = SimulatedFactory::new(Arc::clone(&device));
        let gate = move || gate_open.load(Ordering::SeqCst);
        let supervisor = ConnectionSupervisor::with_gate(
            device.address().clone(),
            SupervisorConfig::default(),
            factory,
            Arc::new(gate),
        )
        .unwrap();
        (device, supervisor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_gate_blocks_reconnect() {
        let gate_open = Arc::new(AtomicBool::new(false));
        let (device, supervisor) = setup(Arc::clone(&gate_open));

        supervisor.monitor_cycle().await.unwrap();
        assert_eq!(device.scans(), 0);
        assert!(!supervisor.is_connected());

        gate_open.store(true, Ordering::SeqCst);
        supervisor.monitor_cycle().await.unwrap();
        assert!(supervisor.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gap_respected() {
        let (device, supervisor) = setup(Arc::new(AtomicBool::new(true)));
        device.set_discoverable(false);

        supervisor.monitor_cycle().await.unwrap();
        supervisor.monitor_cycle().await.unwrap();
        assert_eq!(device.scans(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        supervisor.monitor_cycle().await.unwrap();
        assert_eq!(device.scans(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_monitoring_is_idempotent() {
        let (_device, supervisor) = setup(Arc::new(AtomicBool::new(true)));

        supervisor.start_monitoring();
        supervisor.start_monitoring();
        supervisor.start_monitoring();
        assert!(supervisor.is_monitoring());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(supervisor.is_connected());
        assert_eq!(supervisor.stats().successful_connects, 1);

        supervisor.stop_monitoring();
        assert!(!supervisor.is_monitoring());
        supervisor.shutdown().await;
    }
}
