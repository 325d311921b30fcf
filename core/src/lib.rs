// treadlink core: keeps one BLE treadmill reachable
//
// Everything that touches the radio goes through the peripheral boundary;
// everything that decides *when* to touch it lives in the supervisor.

pub mod peripheral;
pub mod supervisor;

pub use peripheral::simulated::{SimulatedClient, SimulatedFactory, SimulatedTreadmill};
pub use peripheral::{
    BeltState, ClientFactory, ClientHandle, Discovered, PadMode, PadStatus, PeripheralAddress,
    PeripheralClient, PeripheralError, WorkoutSummary,
};
pub use supervisor::{
    AlwaysAttempt, ConnectGate, ConnectionState, ConnectionSupervisor, HealthCheckResult,
    HealthReason, SupervisorConfig, SupervisorError, SupervisorStats,
};

// ============================================================================
// VERSION
// ============================================================================

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
