//! In-process treadmill simulator
//!
//! Stands in for a real BLE stack in tests and in the CLI's simulate mode.
//! A [`SimulatedTreadmill`] is the device plus its radio environment; every
//! handle produced by [`SimulatedFactory`] opens its own session against it,
//! so discarding a handle behaves like tearing down a transport object.
//!
//! Failures are scripted up front (`fail_next_connects`, `set_probe_hangs`,
//! ...) and every operation is counted so tests can assert on exactly what
//! the supervisor did. Hangs never resolve on their own; the caller's
//! deadline is what ends them. All timing uses tokio's clock, so paused-time
//! tests advance instantly.

use std::future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::types::{Discovered, PadMode, PadStatus, PeripheralAddress, RawStatus};
use super::{ClientFactory, ClientHandle, PeripheralClient, PeripheralError};

/// Roughly 108 steps a minute at walking pace
const STEPS_PER_SEC: f64 = 1.8;

/// Another device that is always in range
const NEIGHBOUR_ADDRESS: &str = "00:11:22:33:44:55";

/// Default belt speed in 0.1 km/h units
const DEFAULT_SPEED: u16 = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectFault {
    Timeout,
    Error,
}

struct DeviceState {
    discoverable: bool,
    scan_failures: u32,
    connect_faults: Vec<ConnectFault>,
    probe_hangs: bool,
    probe_errors: u32,
    disconnect_hangs: bool,
    panic_on_next_probe: bool,
    mode: PadMode,
    belt_started_at: Option<Instant>,
    /// Progress banked from earlier belt runs in this session
    banked: RawStatus,
    speed: u16,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            discoverable: true,
            scan_failures: 0,
            connect_faults: Vec::new(),
            probe_hangs: false,
            probe_errors: 0,
            disconnect_hangs: false,
            panic_on_next_probe: false,
            mode: PadMode::Standby,
            belt_started_at: None,
            banked: RawStatus::default(),
            speed: DEFAULT_SPEED,
        }
    }

    fn raw_status(&self, now: Instant) -> RawStatus {
        let mut raw = self.banked;
        raw.mode = match self.mode {
            PadMode::Auto => 0,
            PadMode::Manual => 1,
            PadMode::Standby => 2,
        };

        match self.belt_started_at {
            Some(started) => {
                let secs = now.saturating_duration_since(started).as_secs_f64();
                raw.belt_state = 1;
                raw.speed = self.speed;
                raw.time += secs as u32;
                raw.steps += (secs * STEPS_PER_SEC) as u32;
                // speed/10 km/h over secs, expressed in 10 m units
                raw.dist += (f64::from(self.speed) / 10.0 * secs / 36.0) as u32;
            }
            None => {
                raw.belt_state = if self.mode == PadMode::Standby { 5 } else { 0 };
                raw.speed = 0;
            }
        }
        raw
    }

    fn stop_belt(&mut self, now: Instant) {
        if self.belt_started_at.is_some() {
            let mut raw = self.raw_status(now);
            raw.belt_state = 0;
            raw.speed = 0;
            self.banked = raw;
            self.belt_started_at = None;
        }
    }
}

/// Operation counters, shared by every handle of one device
#[derive(Debug, Default)]
pub struct SimCounters {
    scans: AtomicUsize,
    connects: AtomicUsize,
    probes: AtomicUsize,
    disconnects: AtomicUsize,
    commands: AtomicUsize,
}

/// A simulated treadmill and the air around it
pub struct SimulatedTreadmill {
    address: PeripheralAddress,
    name: String,
    latency: Duration,
    state: Mutex<DeviceState>,
    counters: SimCounters,
}

impl SimulatedTreadmill {
    pub fn new(address: PeripheralAddress) -> Arc<Self> {
        Self::with_latency(address, Duration::ZERO)
    }

    /// Every radio operation sleeps for `latency` before completing
    pub fn with_latency(address: PeripheralAddress, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            address,
            name: "WalkingPad".to_string(),
            latency,
            state: Mutex::new(DeviceState::new()),
            counters: SimCounters::default(),
        })
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Power the device on or off as far as scanning is concerned
    pub fn set_discoverable(&self, discoverable: bool) {
        self.state.lock().discoverable = discoverable;
    }

    /// The next `count` scans fail with a radio error
    pub fn fail_next_scans(&self, count: u32) {
        self.state.lock().scan_failures = count;
    }

    /// The next `count` connects hang until the caller's deadline
    pub fn time_out_next_connects(&self, count: usize) {
        let mut state = self.state.lock();
        state
            .connect_faults
            .extend(std::iter::repeat(ConnectFault::Timeout).take(count));
    }

    /// The next `count` connects are refused by the stack
    pub fn fail_next_connects(&self, count: usize) {
        let mut state = self.state.lock();
        state
            .connect_faults
            .extend(std::iter::repeat(ConnectFault::Error).take(count));
    }

    /// Probes never answer while set (wedged session or sleeping device)
    pub fn set_probe_hangs(&self, hangs: bool) {
        self.state.lock().probe_hangs = hangs;
    }

    /// The next `count` probes fail immediately
    pub fn fail_next_probes(&self, count: u32) {
        self.state.lock().probe_errors = count;
    }

    pub fn set_disconnect_hangs(&self, hangs: bool) {
        self.state.lock().disconnect_hangs = hangs;
    }

    /// The next probe panics inside the stack
    pub fn panic_on_next_probe(&self) {
        self.state.lock().panic_on_next_probe = true;
    }

    pub fn scans(&self) -> usize {
        self.counters.scans.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.counters.probes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> usize {
        self.counters.commands.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> PadMode {
        self.state.lock().mode
    }

    pub fn belt_running(&self) -> bool {
        self.state.lock().belt_started_at.is_some()
    }

    pub fn status(&self) -> PadStatus {
        PadStatus::from_raw(self.state.lock().raw_status(Instant::now()))
    }

    async fn radio_delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

/// One session against a [`SimulatedTreadmill`]
pub struct SimulatedClient {
    device: Arc<SimulatedTreadmill>,
    connected: AtomicBool,
}

impl SimulatedClient {
    pub fn new(device: Arc<SimulatedTreadmill>) -> Self {
        Self {
            device,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Commands need a live session and an awake device
    async fn command_ready(&self) -> Result<(), PeripheralError> {
        if !self.is_connected() {
            return Err(PeripheralError::CommandError("not connected".to_string()));
        }
        self.device.radio_delay().await;
        let reachable = {
            let state = self.device.state.lock();
            state.discoverable && !state.probe_hangs
        };
        if !reachable {
            future::pending::<()>().await;
        }
        self.device.counters.commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PeripheralClient for SimulatedClient {
    async fn discover(&self, timeout: Duration) -> Result<Vec<Discovered>, PeripheralError> {
        self.device.counters.scans.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.device.latency.min(timeout)).await;

        let mut state = self.device.state.lock();
        if state.scan_failures > 0 {
            state.scan_failures -= 1;
            return Err(PeripheralError::ScanFailure(
                "adapter reported an error".to_string(),
            ));
        }

        let mut heard: Vec<Discovered> = PeripheralAddress::new(NEIGHBOUR_ADDRESS)
            .into_iter()
            .map(|address| Discovered {
                address,
                name: Some("Neighbour Speaker".to_string()),
                rssi: Some(-88),
            })
            .collect();
        if state.discoverable {
            heard.push(Discovered {
                address: self.device.address.clone(),
                name: Some(self.device.name.clone()),
                rssi: Some(-61),
            });
        }
        Ok(heard)
    }

    async fn connect(
        &self,
        address: &PeripheralAddress,
        _timeout: Duration,
    ) -> Result<(), PeripheralError> {
        self.device.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.device.radio_delay().await;

        let fault = {
            let mut state = self.device.state.lock();
            if !state.discoverable || address != &self.device.address {
                return Err(PeripheralError::ConnectError(format!(
                    "{} is not reachable",
                    address
                )));
            }
            if state.connect_faults.is_empty() {
                None
            } else {
                Some(state.connect_faults.remove(0))
            }
        };

        match fault {
            Some(ConnectFault::Timeout) => {
                debug!("Simulated connect to {} hanging", address);
                future::pending().await
            }
            Some(ConnectFault::Error) => Err(PeripheralError::ConnectError(
                "GATT connection refused".to_string(),
            )),
            None => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn disconnect(&self, _timeout: Duration) -> Result<(), PeripheralError> {
        self.device.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        self.device.radio_delay().await;

        let hangs = self.device.state.lock().disconnect_hangs;
        if hangs {
            future::pending::<()>().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<PadStatus, PeripheralError> {
        self.device.counters.probes.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(PeripheralError::ProbeError("not connected".to_string()));
        }
        self.device.radio_delay().await;

        let hangs = {
            let mut state = self.device.state.lock();
            if state.panic_on_next_probe {
                state.panic_on_next_probe = false;
                drop(state);
                panic!("simulated transport fault during probe");
            }
            if state.probe_errors > 0 {
                state.probe_errors -= 1;
                return Err(PeripheralError::ProbeError(
                    "characteristic read failed".to_string(),
                ));
            }
            state.probe_hangs || !state.discoverable
        };

        if hangs {
            future::pending::<()>().await;
        }
        Ok(self.device.status())
    }

    async fn switch_mode(&self, mode: PadMode) -> Result<(), PeripheralError> {
        self.command_ready().await?;
        let mut state = self.device.state.lock();
        if mode == PadMode::Standby {
            state.stop_belt(Instant::now());
        }
        state.mode = mode;
        Ok(())
    }

    async fn start_belt(&self) -> Result<(), PeripheralError> {
        self.command_ready().await?;
        let now = Instant::now();
        let mut state = self.device.state.lock();
        if state.mode != PadMode::Manual {
            return Err(PeripheralError::CommandError(format!(
                "belt cannot start in {} mode",
                state.mode
            )));
        }
        if state.belt_started_at.is_some() {
            state.stop_belt(now);
        } else {
            state.belt_started_at = Some(now);
        }
        Ok(())
    }

    async fn request_history(&self) -> Result<PadStatus, PeripheralError> {
        self.command_ready().await?;
        Ok(self.device.status())
    }
}

/// Hands out fresh [`SimulatedClient`] sessions for one device
pub struct SimulatedFactory {
    device: Arc<SimulatedTreadmill>,
    created: AtomicUsize,
}

impl SimulatedFactory {
    pub fn new(device: Arc<SimulatedTreadmill>) -> Arc<Self> {
        Arc::new(Self {
            device,
            created: AtomicUsize::new(0),
        })
    }

    pub fn device(&self) -> &Arc<SimulatedTreadmill> {
        &self.device
    }

    /// How many handles have been created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ClientFactory for SimulatedFactory {
    fn create(&self) -> ClientHandle {
        self.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(SimulatedClient::new(Arc::clone(&self.device)))
    }
}
