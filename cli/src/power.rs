// Host power detection for the monitor's reconnect gate
//
// With `require_power` set, the monitor only reconnects on its own while the
// host is on mains power or drives an external display. A laptop on battery
// leaves the radio alone; explicit API requests still connect.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use treadlink_core::ConnectGate;

const SYSFS_POWER_SUPPLY: &str = "/sys/class/power_supply";
const SYSFS_DRM: &str = "/sys/class/drm";

/// Connectors that are built into the machine, never an external display
const INTERNAL_CONNECTORS: [&str; 3] = ["eDP", "LVDS", "DSI"];

/// Reconnect gate backed by a periodically refreshed power reading
pub struct HostPowerGate {
    powered: AtomicBool,
}

impl HostPowerGate {
    /// Take a first reading, then refresh every `poll` until the gate is dropped
    pub async fn spawn(poll: Duration) -> Arc<Self> {
        let gate = Arc::new(Self {
            powered: AtomicBool::new(host_on_power().await),
        });
        info!(
            "Host power gate enabled (on power: {})",
            gate.powered.load(Ordering::SeqCst)
        );

        let weak = Arc::downgrade(&gate);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reading = host_on_power().await;
                let Some(gate) = weak.upgrade() else {
                    return;
                };
                if gate.powered.swap(reading, Ordering::SeqCst) != reading {
                    info!("Host power changed, monitor reconnects allowed: {}", reading);
                }
            }
        });

        gate
    }
}

impl ConnectGate for HostPowerGate {
    fn allows_attempt(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }
}

async fn host_on_power() -> bool {
    #[cfg(target_os = "linux")]
    {
        mains_online(Path::new(SYSFS_POWER_SUPPLY)).await
            || external_display_connected(Path::new(SYSFS_DRM)).await
    }

    #[cfg(target_os = "macos")]
    {
        macos_on_power().await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        true
    }
}

/// Any non-battery supply online. Machines without a battery count as powered.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
async fn mains_online(root: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return true;
    };

    let mut saw_battery = false;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let kind = read_trimmed(&path.join("type")).await.unwrap_or_default();
        if kind == "Battery" {
            saw_battery = true;
            continue;
        }
        if read_trimmed(&path.join("online")).await.as_deref() == Some("1") {
            debug!("Power supply {} online", entry.file_name().to_string_lossy());
            return true;
        }
    }

    !saw_battery
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
async fn external_display_connected(root: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return false;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        // card0-HDMI-A-1 -> HDMI-A-1; bare card0 is the GPU itself
        let Some((_, connector)) = name.split_once('-') else {
            continue;
        };
        if INTERNAL_CONNECTORS
            .iter()
            .any(|internal| connector.starts_with(internal))
        {
            continue;
        }
        if read_trimmed(&entry.path().join("status")).await.as_deref() == Some("connected") {
            debug!("External display on {}", connector);
            return true;
        }
    }

    false
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path)
        .await
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(target_os = "macos")]
async fn macos_on_power() -> bool {
    if let Some(out) = command_output("pmset", &["-g", "ps"]).await {
        if pmset_reports_ac(&out) {
            return true;
        }
    }
    command_output("system_profiler", &["SPDisplaysDataType"])
        .await
        .is_some_and(|out| display_count(&out) > 1)
}

#[cfg(target_os = "macos")]
async fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn pmset_reports_ac(output: &str) -> bool {
    output.contains("'AC Power'")
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn display_count(output: &str) -> usize {
    output.matches("Resolution:").count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use treadlink_core::{
        ConnectionSupervisor, PeripheralAddress, SimulatedFactory, SimulatedTreadmill,
        SupervisorConfig,
    };

    fn write(root: &Path, entry: &str, file: &str, contents: &str) {
        let dir = root.join(entry);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), contents).unwrap();
    }

    #[tokio::test]
    async fn test_mains_detection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();

        write(root, "BAT0", "type", "Battery\n");
        write(root, "AC", "type", "Mains\n");
        write(root, "AC", "online", "0\n");
        assert!(!mains_online(root).await);

        write(root, "AC", "online", "1\n");
        assert!(mains_online(root).await);
    }

    #[tokio::test]
    async fn test_desktop_without_battery_counts_as_powered() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(mains_online(temp_dir.path()).await);
        assert!(mains_online(&temp_dir.path().join("missing")).await);
    }

    #[tokio::test]
    async fn test_external_display_detection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();

        std::fs::create_dir_all(root.join("card0")).unwrap();
        write(root, "card0-eDP-1", "status", "connected\n");
        write(root, "card0-HDMI-A-1", "status", "disconnected\n");
        assert!(!external_display_connected(root).await);

        write(root, "card0-DP-2", "status", "connected\n");
        assert!(external_display_connected(root).await);
    }

    #[test]
    fn test_macos_output_parsing() {
        let on_battery = "Now drawing from 'Battery Power'\n -InternalBattery-0 (id=1)\t87%; discharging";
        let on_ac = "Now drawing from 'AC Power'\n -InternalBattery-0 (id=1)\t100%; charged";
        assert!(!pmset_reports_ac(on_battery));
        assert!(pmset_reports_ac(on_ac));

        let displays = "Color LCD:\n  Resolution: 3024 x 1964\nDELL U2720Q:\n  Resolution: 3840 x 2160\n";
        assert_eq!(display_count(displays), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpowered_host_blocks_monitor_reconnect() {
        let gate = Arc::new(HostPowerGate {
            powered: AtomicBool::new(false),
        });
        let device =
            SimulatedTreadmill::new(PeripheralAddress::new("AA:BB:CC:DD:EE:02").unwrap());
        let supervisor = ConnectionSupervisor::with_gate(
            device.address().clone(),
            SupervisorConfig::default(),
            SimulatedFactory::new(Arc::clone(&device)),
            gate.clone(),
        )
        .unwrap();

        supervisor.start_monitoring();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!supervisor.is_connected());
        assert_eq!(device.scans(), 0);

        gate.powered.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(supervisor.is_connected());

        supervisor.shutdown().await;
    }
}
