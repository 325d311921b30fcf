// Integration tests for connect-with-backoff
//
// Runs the supervisor against the in-process simulated treadmill with tokio's
// clock paused, so backoff sleeps and timeouts show up as exact elapsed times.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use treadlink_core::{
    ConnectionState, ConnectionSupervisor, PeripheralAddress, SimulatedFactory,
    SimulatedTreadmill, SupervisorConfig,
};

fn rig(
    config: SupervisorConfig,
) -> (
    Arc<SimulatedTreadmill>,
    Arc<SimulatedFactory>,
    Arc<ConnectionSupervisor>,
) {
    let device = SimulatedTreadmill::new(PeripheralAddress::new("c0:ff:ee:00:00:01").unwrap());
    let factory = SimulatedFactory::new(Arc::clone(&device));
    let supervisor =
        ConnectionSupervisor::new(device.address().clone(), config, factory.clone()).unwrap();
    (device, factory, supervisor)
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_never_discoverable_scans_once_and_never_connects() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());
    device.set_discoverable(false);

    assert!(!supervisor.connect_with_backoff(5).await);

    assert_eq!(device.scans(), 1);
    assert_eq!(device.connects(), 0);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    println!("✓ Absent treadmill aborted after a single scan");
}

#[tokio::test(start_paused = true)]
async fn test_two_timeouts_then_success_waits_base_then_double() {
    let (device, _factory, supervisor) = rig(fast_config());
    device.time_out_next_connects(2);

    let started = Instant::now();
    assert!(supervisor.connect_with_backoff(5).await);
    let elapsed = started.elapsed();

    // 2s timeout, 500ms backoff, 2s timeout, 1s backoff, then success
    assert_eq!(elapsed, Duration::from_millis(5500));
    assert_eq!(device.connects(), 3);
    assert!(supervisor.is_connected());
    assert!(supervisor.connected_since().is_some());
    assert_eq!(supervisor.stats().connect_attempts, 3);
    assert_eq!(supervisor.stats().successful_connects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connects_back_off_exponentially() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());
    device.fail_next_connects(3);

    let started = Instant::now();
    assert!(supervisor.connect_with_backoff(5).await);

    assert_eq!(started.elapsed(), Duration::from_millis(500 + 1000 + 2000));
    assert_eq!(device.connects(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_end_disconnected() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());
    device.fail_next_connects(10);

    assert!(!supervisor.connect_with_backoff(3).await);

    assert_eq!(device.connects(), 3);
    // Each failed attempt is followed by a cleanup disconnect
    assert_eq!(device.disconnects(), 3);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_after_connect_is_retried() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());
    device.fail_next_probes(1);

    assert!(supervisor.connect_with_backoff(5).await);

    assert_eq!(device.connects(), 2);
    assert_eq!(device.probes(), 2);
    assert!(supervisor.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_scan_failure_aborts_without_connecting() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());
    device.fail_next_scans(1);

    assert!(!supervisor.connect_with_backoff(5).await);
    assert_eq!(device.connects(), 0);

    // The radio recovers on the next try
    assert!(supervisor.connect_with_backoff(5).await);
}

#[tokio::test(start_paused = true)]
async fn test_already_connected_is_idempotent() {
    let (device, factory, supervisor) = rig(SupervisorConfig::default());
    assert!(supervisor.connect_with_backoff(5).await);
    let since = supervisor.connected_since();

    let before = (device.scans(), device.connects(), device.probes());
    for _ in 0..5 {
        assert!(supervisor.connect_with_backoff(5).await);
    }

    assert_eq!((device.scans(), device.connects(), device.probes()), before);
    assert_eq!(supervisor.connected_since(), since);
    assert_eq!(factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_contended_lock_reports_state_without_waiting() {
    let device = SimulatedTreadmill::with_latency(
        PeripheralAddress::new("c0:ff:ee:00:00:01").unwrap(),
        Duration::from_millis(100),
    );
    let factory = SimulatedFactory::new(Arc::clone(&device));
    let supervisor = ConnectionSupervisor::new(
        device.address().clone(),
        SupervisorConfig::default(),
        factory,
    )
    .unwrap();

    let (first, second) = futures::join!(
        supervisor.connect_with_backoff(5),
        supervisor.connect_with_backoff(5)
    );

    // The loser reads the state as it was mid-attempt instead of queueing
    assert!(first);
    assert!(!second);
    assert_eq!(device.scans(), 1);
    assert_eq!(device.connects(), 1);
    assert!(supervisor.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_fresh_scan_is_reused_until_ttl() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());

    assert!(supervisor.connect_with_backoff(5).await);
    supervisor.disconnect_safe().await.unwrap();
    assert!(supervisor.connect_with_backoff(5).await);
    assert_eq!(device.scans(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    supervisor.disconnect_safe().await.unwrap();
    assert!(supervisor.connect_with_backoff(5).await);
    assert_eq!(device.scans(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_attempt_does_not_stay_connecting() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());
    device.time_out_next_connects(1);

    let outcome =
        tokio::time::timeout(Duration::from_secs(1), supervisor.connect_with_backoff(5)).await;

    assert!(outcome.is_err());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);

    // The lock was released with the dropped attempt
    assert!(supervisor.connect_with_backoff(5).await);
}

#[tokio::test(start_paused = true)]
async fn test_reset_during_connect_round_waits_at_most_disconnect_timeout() {
    let (device, _factory, supervisor) = rig(SupervisorConfig::default());
    device.time_out_next_connects(5);

    let round = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.connect_with_backoff(5).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(supervisor.state(), ConnectionState::Connecting);

    let started = Instant::now();
    let _ = supervisor.disconnect_safe().await;

    // Lock wait is bounded; the old handle releases immediately
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(supervisor.client_generation(), 1);

    // The interrupted round notices the reset and gives up
    assert!(!round.await.unwrap());
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    assert_eq!(supervisor.stats().connect_attempts, 1);
    assert_eq!(supervisor.stats().successful_connects, 0);
}
