//! Connection supervisor
//!
//! Single authority over the link to one treadmill. It discovers the
//! peripheral, connects with bounded retries, verifies liveness and tears the
//! session down when it goes quiet or gets old. Callers only ever see a usable
//! [`ClientHandle`] or [`SupervisorError::Unavailable`]; transport failures are
//! absorbed here and turned into state transitions.
//!
//! Only one connect or disconnect transition runs at a time. A caller that
//! finds the connection lock taken reads the current state instead of
//! queueing behind it.
//!
//! Every client handle carries a generation number. A failure observed on an
//! old handle never tears down the session that replaced it.

pub mod backoff;
pub mod config;
mod monitor;
pub mod scan_cache;
pub mod state;

pub use backoff::backoff_delay;
pub use config::SupervisorConfig;
pub use monitor::{AlwaysAttempt, ConnectGate};
pub use scan_cache::{ScanCache, ScanCacheEntry};
pub use state::{ConnectionState, HealthCheckResult, HealthReason, SupervisorStats};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{watch, MutexGuard};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::peripheral::{ClientFactory, ClientHandle, PeripheralAddress, PeripheralError};
use state::StatCounters;

/// Extra time a discovery call gets past its own scan window
const SCAN_GRACE: Duration = Duration::from_secs(1);

/// Errors surfaced by the supervisor
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Treadmill unavailable after waiting {waited:?}")]
    Unavailable { waited: Duration },
    #[error("Invalid supervisor config: {0}")]
    InvalidConfig(String),
}

/// Supervises the connection to a single peripheral
pub struct ConnectionSupervisor {
    address: PeripheralAddress,
    config: SupervisorConfig,
    factory: Arc<dyn ClientFactory>,
    gate: Arc<dyn ConnectGate>,
    client: RwLock<ClientHandle>,
    /// Bumped every time the client handle is replaced
    generation: AtomicU64,
    state: RwLock<ConnectionState>,
    connect_lock: tokio::sync::Mutex<()>,
    scan_cache: ScanCache,
    last_health: Mutex<Option<(Instant, HealthCheckResult)>>,
    last_attempt: Mutex<Option<Instant>>,
    last_reset_reason: Mutex<Option<String>>,
    monitoring: watch::Sender<bool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<AbortHandle>>,
    counters: StatCounters,
}

/// Puts the state back to Disconnected if a connect attempt ends without
/// reaching Connected, including when the attempt's future is dropped.
struct ConnectingGuard<'a> {
    state: &'a RwLock<ConnectionState>,
}

impl<'a> ConnectingGuard<'a> {
    fn enter(state: &'a RwLock<ConnectionState>) -> Self {
        *state.write() = ConnectionState::Connecting;
        Self { state }
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Disconnected;
        }
    }
}

impl ConnectionSupervisor {
    /// Create a supervisor for `address`. Monitoring is not started.
    pub fn new(
        address: PeripheralAddress,
        config: SupervisorConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Arc<Self>, SupervisorError> {
        Self::with_gate(address, config, factory, Arc::new(AlwaysAttempt))
    }

    /// Like [`new`](Self::new), with a gate the monitor consults before
    /// reconnecting on its own
    pub fn with_gate(
        address: PeripheralAddress,
        config: SupervisorConfig,
        factory: Arc<dyn ClientFactory>,
        gate: Arc<dyn ConnectGate>,
    ) -> Result<Arc<Self>, SupervisorError> {
        config.validate()?;

        let client = factory.create();
        let (monitoring, _) = watch::channel(false);

        Ok(Arc::new(Self {
            scan_cache: ScanCache::new(config.cache_ttl),
            address,
            config,
            factory,
            gate,
            client: RwLock::new(client),
            generation: AtomicU64::new(0),
            state: RwLock::new(ConnectionState::Disconnected),
            connect_lock: tokio::sync::Mutex::new(()),
            last_health: Mutex::new(None),
            last_attempt: Mutex::new(None),
            last_reset_reason: Mutex::new(None),
            monitoring,
            watchdog: Mutex::new(None),
            monitor_task: Mutex::new(None),
            counters: StatCounters::default(),
        }))
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn connected_since(&self) -> Option<Instant> {
        self.state().connected_since()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.counters.snapshot()
    }

    /// Most recent health check result and when it was taken
    pub fn last_health(&self) -> Option<(Instant, HealthCheckResult)> {
        *self.last_health.lock()
    }

    pub fn last_reset_reason(&self) -> Option<String> {
        self.last_reset_reason.lock().clone()
    }

    /// How many times the client handle has been discarded and recreated
    pub fn client_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn scan_cache(&self) -> &ScanCache {
        &self.scan_cache
    }

    fn client(&self) -> ClientHandle {
        Arc::clone(&self.client.read())
    }

    /// Current handle with the generation it belongs to
    fn current_client(&self) -> (ClientHandle, u64) {
        let _state = self.state.read();
        (self.client(), self.client_generation())
    }

    /// Move to Connected unless a teardown replaced the handle meanwhile
    fn mark_connected(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        if self.client_generation() != generation {
            return false;
        }
        let next = ConnectionState::Connected {
            since: Instant::now(),
        };
        debug!("Connection state {} -> {}", *state, next);
        *state = next;
        true
    }

    /// Return a client that answered a probe, connecting if needed.
    ///
    /// Gives up with [`SupervisorError::Unavailable`] once `timeout` has
    /// elapsed; no sub-step is allowed to run past that deadline.
    pub async fn get_connection(&self, timeout: Duration) -> Result<ClientHandle, SupervisorError> {
        let started = Instant::now();
        let deadline = started + timeout;

        match timeout_at(deadline, self.acquire(deadline)).await {
            Ok(client) => Ok(client),
            Err(_) => {
                let waited = started.elapsed();
                warn!("No connection to {} within {:?}", self.address, waited);
                Err(SupervisorError::Unavailable { waited })
            }
        }
    }

    async fn acquire(&self, deadline: Instant) -> ClientHandle {
        if self.is_connected() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let bound = self.config.fast_probe_timeout.min(remaining);
            let (client, generation) = self.current_client();

            match timeout(bound, client.probe()).await {
                Ok(Ok(_)) => return client,
                Ok(Err(e)) => warn!("Fast probe failed, reconnecting: {}", e),
                Err(_) => warn!("Fast probe timed out after {:?}, reconnecting", bound),
            }
            let _ = self.disconnect_if(generation).await;
        }

        loop {
            let attempts = if self.scan_cache.is_fresh(&self.address) {
                self.config.quick_connect_attempts
            } else {
                self.config.max_connect_attempts
            };

            if self.connect_with_backoff(attempts).await {
                return self.client();
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.retry_poll_interval.min(remaining)).await;
        }
    }

    /// Scan if needed, then connect with exponential backoff.
    ///
    /// Returns true once connected and probed. If another attempt already
    /// holds the connection lock this returns the current state without
    /// waiting. Already connected means true with no transport calls.
    pub async fn connect_with_backoff(&self, max_attempts: u32) -> bool {
        let Ok(_lock) = self.connect_lock.try_lock() else {
            debug!("Connect already in progress, reporting current state");
            return self.is_connected();
        };

        if self.is_connected() {
            return true;
        }

        *self.last_attempt.lock() = Some(Instant::now());

        if !self.scan_cache.is_fresh(&self.address) {
            match self.scan().await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Treadmill {} not discoverable, skipping connect", self.address);
                    return false;
                }
                Err(e) => {
                    warn!("Scan for {} failed: {}", self.address, e);
                    return false;
                }
            }
        }

        let _connecting = ConnectingGuard::enter(&self.state);
        let (client, generation) = self.current_client();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay =
                    backoff_delay(self.config.backoff_base, self.config.backoff_cap, attempt - 1);
                debug!("Waiting {:?} before attempt {}", delay, attempt + 1);
                tokio::time::sleep(delay).await;
            }
            if self.client_generation() != generation {
                info!("Connect round for {} cut short by a reset", self.address);
                return false;
            }

            StatCounters::bump(&self.counters.connect_attempts);
            debug!(
                "Connect attempt {}/{} to {}",
                attempt + 1,
                max_attempts,
                self.address
            );

            match self.open_session(&client).await {
                Ok(()) => {
                    *self.last_health.lock() = None;
                    if !self.mark_connected(generation) {
                        info!("Session to {} opened after a reset, dropping it", self.address);
                        self.release_half_open(&client).await;
                        return false;
                    }
                    StatCounters::bump(&self.counters.successful_connects);
                    info!(
                        "Connected to {} after {} attempt(s)",
                        self.address,
                        attempt + 1
                    );
                    return true;
                }
                Err(e) => {
                    warn!("Attempt {} to {} failed: {}", attempt + 1, self.address, e);
                    self.release_half_open(&client).await;
                }
            }
        }

        warn!(
            "Giving up on {} after {} attempts",
            self.address, max_attempts
        );
        false
    }

    /// Connect, then probe once; a bare connect event is not trusted
    async fn open_session(&self, client: &ClientHandle) -> Result<(), PeripheralError> {
        let connect_timeout = self.config.connect_timeout;
        timeout(connect_timeout, client.connect(&self.address, connect_timeout))
            .await
            .map_err(|_| PeripheralError::ConnectTimeout(connect_timeout))??;

        let probe_timeout = self.config.command_timeout;
        timeout(probe_timeout, client.probe())
            .await
            .map_err(|_| PeripheralError::ProbeTimeout(probe_timeout))??;

        Ok(())
    }

    async fn release_half_open(&self, client: &ClientHandle) {
        let bound = self.config.disconnect_timeout;
        match timeout(bound, client.disconnect(bound)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Cleanup disconnect failed: {}", e),
            Err(_) => debug!("Cleanup disconnect timed out after {:?}", bound),
        }
    }

    /// Discover once and record the result. `Ok(true)` if our peripheral was heard.
    async fn scan(&self) -> Result<bool, PeripheralError> {
        StatCounters::bump(&self.counters.scans);
        let scan_timeout = self.config.scan_timeout;
        let client = self.client();

        let heard = timeout(scan_timeout + SCAN_GRACE, client.discover(scan_timeout))
            .await
            .map_err(|_| {
                PeripheralError::ScanFailure(format!("no scan result within {:?}", scan_timeout))
            })??;

        self.scan_cache.record_scan(&heard);
        let found = heard.iter().any(|device| device.address == self.address);
        if !found {
            self.scan_cache.invalidate(&self.address);
        }
        debug!("Scan heard {} device(s), target found: {}", heard.len(), found);
        Ok(found)
    }

    /// Mark the connection down and swap in a fresh client.
    ///
    /// State is Disconnected on return whatever the transport does. Waiting
    /// for a running connect round and the old handle's disconnect are each
    /// bounded by `disconnect_timeout`; a round still running after that is
    /// cut short when it next checks the client generation. The disconnect
    /// outcome is returned for logging only.
    pub async fn disconnect_safe(&self) -> Result<(), PeripheralError> {
        let _lock = self.lock_for_teardown().await;
        self.teardown().await
    }

    /// [`disconnect_safe`](Self::disconnect_safe), but only while `generation`
    /// is still the current client. `Ok(false)` when the session has already
    /// been replaced.
    pub async fn disconnect_if(&self, generation: u64) -> Result<bool, PeripheralError> {
        let _lock = self.lock_for_teardown().await;
        if self.client_generation() != generation {
            debug!(
                "Client generation {} already replaced, keeping current session",
                generation
            );
            return Ok(false);
        }
        self.teardown().await.map(|()| true)
    }

    async fn lock_for_teardown(&self) -> Option<MutexGuard<'_, ()>> {
        let bound = self.config.disconnect_timeout;
        match timeout(bound, self.connect_lock.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(
                    "Connect round for {} still running after {:?}, resetting anyway",
                    self.address, bound
                );
                None
            }
        }
    }

    async fn teardown(&self) -> Result<(), PeripheralError> {
        let fresh = self.factory.create();
        let old = {
            let mut state = self.state.write();
            let old = std::mem::replace(&mut *self.client.write(), fresh);
            self.generation.fetch_add(1, Ordering::SeqCst);
            if *state != ConnectionState::Disconnected {
                debug!("Connection state {} -> disconnected", *state);
            }
            *state = ConnectionState::Disconnected;
            old
        };
        *self.last_health.lock() = None;

        let bound = self.config.disconnect_timeout;
        let outcome = match timeout(bound, old.disconnect(bound)).await {
            Ok(result) => result,
            Err(_) => Err(PeripheralError::DisconnectTimeout(bound)),
        };

        match &outcome {
            Ok(()) => debug!("Released client for {}", self.address),
            Err(e) => warn!("Client for {} released uncleanly: {}", self.address, e),
        }
        outcome
    }

    /// Full teardown for a session that looks wedged or has aged out
    pub async fn force_reset(&self, reason: &str) {
        self.reset_if_current(self.client_generation(), reason).await;
    }

    async fn reset_if_current(&self, generation: u64, reason: &str) -> bool {
        let _lock = self.lock_for_teardown().await;
        if self.client_generation() != generation {
            debug!("Skipping reset of {} ({}): session already replaced", self.address, reason);
            return false;
        }
        StatCounters::bump(&self.counters.forced_resets);
        warn!("Forcing reset of {}: {}", self.address, reason);
        *self.last_reset_reason.lock() = Some(reason.to_string());
        let _ = self.teardown().await;
        true
    }

    /// Reset the session if it has outlived `max_connection_age`
    async fn refresh_if_stale(&self, since: Instant, generation: u64) -> Option<HealthCheckResult> {
        let age = since.elapsed();
        if age <= self.config.max_connection_age {
            return None;
        }
        info!("Connection to {} is {:?} old, refreshing", self.address, age);
        self.reset_if_current(generation, "connection exceeded maximum age")
            .await;
        Some(HealthCheckResult::failed(HealthReason::Stale))
    }

    /// Probe the live session, rate limited by `health_check_interval`.
    pub async fn health_check(&self) -> HealthCheckResult {
        let Some(since) = self.connected_since() else {
            return HealthCheckResult::failed(HealthReason::NotConnected);
        };
        let (client, generation) = self.current_client();

        // Staleness is checked ahead of the rate limit
        if let Some(stale) = self.refresh_if_stale(since, generation).await {
            return stale;
        }

        if let Some((at, result)) = self.last_health() {
            if at.elapsed() < self.config.health_check_interval {
                return result;
            }
        }

        StatCounters::bump(&self.counters.health_checks);
        let probe_timeout = self.config.command_timeout;

        let result = match timeout(probe_timeout, client.probe()).await {
            Ok(Ok(_)) => self
                .refresh_if_stale(since, generation)
                .await
                .unwrap_or_else(HealthCheckResult::healthy),
            Ok(Err(e)) => {
                warn!("Health probe to {} failed: {}", self.address, e);
                HealthCheckResult::failed(HealthReason::TransportError)
            }
            Err(_) => {
                warn!(
                    "Health probe to {} timed out after {:?}, rescanning",
                    self.address, probe_timeout
                );
                match self.scan().await {
                    Ok(true) => {
                        self.reset_if_current(
                            generation,
                            "probe timed out while peripheral discoverable",
                        )
                        .await;
                    }
                    Ok(false) => info!("Treadmill {} went out of range", self.address),
                    Err(e) => warn!("Rescan after probe timeout failed: {}", e),
                }
                HealthCheckResult::failed(HealthReason::Timeout)
            }
        };

        // Only cache results about the current handle
        if self.client_generation() == generation {
            *self.last_health.lock() = Some((Instant::now(), result));
        }
        result
    }

    /// Stop monitoring and release the client
    pub async fn shutdown(&self) {
        self.stop_monitoring();
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        if let Some(task) = self.monitor_task.lock().take() {
            task.abort();
        }
        let _ = self.disconnect_safe().await;
        info!("Supervisor for {} shut down", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::{Discovered, MockPeripheralClient, PadStatus, RawStatus};

    fn address() -> PeripheralAddress {
        PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap()
    }

    fn mock_factory<F>(build: F) -> Arc<dyn ClientFactory>
    where
        F: Fn() -> MockPeripheralClient + Send + Sync + 'static,
    {
        Arc::new(move || -> ClientHandle { Arc::new(build()) })
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = SupervisorConfig {
            backoff_cap: Duration::ZERO,
            ..Default::default()
        };
        let result =
            ConnectionSupervisor::new(address(), config, mock_factory(MockPeripheralClient::new));
        assert!(matches!(result, Err(SupervisorError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_disconnected() {
        let supervisor = ConnectionSupervisor::new(
            address(),
            SupervisorConfig::default(),
            mock_factory(MockPeripheralClient::new),
        )
        .unwrap();
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(supervisor.connected_since(), None);
        assert_eq!(supervisor.stats(), SupervisorStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_call_makes_no_transport_calls() {
        // Only the first handle is ever used; any call beyond these
        // expectations panics inside the mock
        let factory = mock_factory(|| {
            let mut mock = MockPeripheralClient::new();
            mock.expect_discover().times(1).returning(|_| {
                Ok(vec![Discovered {
                    address: PeripheralAddress::new("aa:bb:cc:dd:ee:ff").unwrap(),
                    name: None,
                    rssi: Some(-60),
                }])
            });
            mock.expect_connect().times(1).returning(|_, _| Ok(()));
            mock.expect_probe()
                .times(1)
                .returning(|| Ok(PadStatus::from_raw(RawStatus::default())));
            mock
        });

        let supervisor =
            ConnectionSupervisor::new(address(), SupervisorConfig::default(), factory).unwrap();
        assert!(supervisor.connect_with_backoff(5).await);

        for _ in 0..3 {
            assert!(supervisor.connect_with_backoff(5).await);
        }
        let stats = supervisor.stats();
        assert_eq!(stats.scans, 1);
        assert_eq!(stats.connect_attempts, 1);
        assert_eq!(stats.successful_connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_aborts_attempt() {
        let factory = mock_factory(|| {
            let mut mock = MockPeripheralClient::new();
            mock.expect_discover()
                .returning(|_| Err(PeripheralError::ScanFailure("adapter off".into())));
            mock
        });
        let supervisor =
            ConnectionSupervisor::new(address(), SupervisorConfig::default(), factory).unwrap();

        assert!(!supervisor.connect_with_backoff(5).await);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(supervisor.stats().connect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_safe_survives_transport_error() {
        let factory = mock_factory(|| {
            let mut mock = MockPeripheralClient::new();
            mock.expect_disconnect()
                .returning(|_| Err(PeripheralError::DisconnectError("busy".into())));
            mock
        });
        let supervisor =
            ConnectionSupervisor::new(address(), SupervisorConfig::default(), factory).unwrap();

        let outcome = supervisor.disconnect_safe().await;
        assert!(matches!(outcome, Err(PeripheralError::DisconnectError(_))));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(supervisor.client_generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_when_disconnected() {
        let supervisor = ConnectionSupervisor::new(
            address(),
            SupervisorConfig::default(),
            mock_factory(MockPeripheralClient::new),
        )
        .unwrap();
        let result = supervisor.health_check().await;
        assert_eq!(result, HealthCheckResult::failed(HealthReason::NotConnected));
        assert_eq!(supervisor.stats().health_checks, 0);
    }
}
