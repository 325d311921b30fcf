//! Peripheral boundary
//!
//! The supervisor never talks to a radio directly. Everything it needs from
//! the BLE stack goes through [`PeripheralClient`], which a platform backend
//! (or the in-process [`simulated`] treadmill) implements:
//!
//! - **discover**: bounded scan returning every device that was heard
//! - **connect / disconnect**: GATT session lifecycle for one address
//! - **probe**: a cheap status query used purely as a liveness check
//! - **commands**: the handful of domain requests the façade issues
//!
//! Handles are replaced wholesale on reset, so backends can keep whatever
//! internal session state they like without it leaking across reconnects.

pub mod simulated;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use types::{
    AddressError, BeltState, Discovered, PadMode, PadStatus, PeripheralAddress, RawStatus,
    UnknownMode, WorkoutSummary,
};

/// Transport-level failures reported by a peripheral client.
///
/// None of these escape the supervisor; they are folded into state
/// transitions and logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeripheralError {
    #[error("Scan failed: {0}")]
    ScanFailure(String),
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Connect failed: {0}")]
    ConnectError(String),
    #[error("Probe timed out after {0:?}")]
    ProbeTimeout(Duration),
    #[error("Probe failed: {0}")]
    ProbeError(String),
    #[error("Disconnect timed out after {0:?}")]
    DisconnectTimeout(Duration),
    #[error("Disconnect failed: {0}")]
    DisconnectError(String),
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),
    #[error("Command failed: {0}")]
    CommandError(String),
}

impl PeripheralError {
    /// Whether this error came from the deadline wrapper rather than the stack
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PeripheralError::ConnectTimeout(_)
                | PeripheralError::ProbeTimeout(_)
                | PeripheralError::DisconnectTimeout(_)
                | PeripheralError::CommandTimeout(_)
        )
    }
}

/// Operations the supervisor and façade need from a BLE stack
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeripheralClient: Send + Sync {
    /// Scan for `timeout` and return everything that was heard
    async fn discover(&self, timeout: Duration) -> Result<Vec<Discovered>, PeripheralError>;

    /// Open a session to `address`
    async fn connect(
        &self,
        address: &PeripheralAddress,
        timeout: Duration,
    ) -> Result<(), PeripheralError>;

    /// Close the current session, if any
    async fn disconnect(&self, timeout: Duration) -> Result<(), PeripheralError>;

    /// Cheap status request; success means the link is alive
    async fn probe(&self) -> Result<PadStatus, PeripheralError>;

    async fn switch_mode(&self, mode: PadMode) -> Result<(), PeripheralError>;

    /// Start the belt. The device treats this as a toggle, so callers put it
    /// in a known mode first.
    async fn start_belt(&self) -> Result<(), PeripheralError>;

    /// Ask for the record of the current or most recent session
    async fn request_history(&self) -> Result<PadStatus, PeripheralError>;
}

/// Shared handle given out to callers
pub type ClientHandle = Arc<dyn PeripheralClient>;

/// Produces fresh client handles.
///
/// Called once when the supervisor is built and again on every reset, so a
/// wedged transport session is discarded along with the object holding it.
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> ClientHandle;
}

impl<F> ClientFactory for F
where
    F: Fn() -> ClientHandle + Send + Sync,
{
    fn create(&self) -> ClientHandle {
        self()
    }
}
