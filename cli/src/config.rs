// Configuration management for the treadlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/treadlink/config.json
// - Linux: ~/.config/treadlink/config.json
// - Windows: %APPDATA%\treadlink\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use treadlink_core::{PeripheralAddress, SupervisorConfig};

/// Environment variable that overrides the configured treadmill address
pub const ADDRESS_ENV: &str = "TREADLINK_ADDRESS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hardware address of the treadmill
    pub address: String,

    /// Where the control API listens
    pub listen_addr: String,

    /// Default log filter when RUST_LOG is unset
    pub log_level: String,

    /// Directory for rolling log files; console only when unset
    pub log_dir: Option<String>,

    /// Drive an in-process simulated treadmill instead of a radio
    pub simulate: bool,

    /// How long an API request may wait for a connection, in seconds
    pub request_timeout_secs: u64,

    /// Only let the monitor reconnect while on mains power or an external display
    pub require_power: bool,

    /// Supervisor timings
    pub supervisor: SupervisorSettings,
}

/// Supervisor timings in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_connection_age_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_connect_attempts: u32,
    pub min_retry_gap_ms: u64,
    pub scan_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub fast_probe_timeout_ms: u64,
    pub quick_connect_attempts: u32,
    pub monitor_interval_ms: u64,
    pub monitor_error_interval_ms: u64,
    pub restart_delay_ms: u64,
    pub retry_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: String::new(),
            listen_addr: "127.0.0.1:5678".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            simulate: false,
            request_timeout_secs: 30,
            require_power: false,
            supervisor: SupervisorSettings::default(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        let defaults = SupervisorConfig::default();
        Self {
            connect_timeout_ms: millis(defaults.connect_timeout),
            command_timeout_ms: millis(defaults.command_timeout),
            disconnect_timeout_ms: millis(defaults.disconnect_timeout),
            health_check_interval_ms: millis(defaults.health_check_interval),
            max_connection_age_ms: millis(defaults.max_connection_age),
            backoff_base_ms: millis(defaults.backoff_base),
            backoff_cap_ms: millis(defaults.backoff_cap),
            max_connect_attempts: defaults.max_connect_attempts,
            min_retry_gap_ms: millis(defaults.min_retry_gap),
            scan_timeout_ms: millis(defaults.scan_timeout),
            cache_ttl_ms: millis(defaults.cache_ttl),
            fast_probe_timeout_ms: millis(defaults.fast_probe_timeout),
            quick_connect_attempts: defaults.quick_connect_attempts,
            monitor_interval_ms: millis(defaults.monitor_interval),
            monitor_error_interval_ms: millis(defaults.monitor_error_interval),
            restart_delay_ms: millis(defaults.restart_delay),
            retry_poll_interval_ms: millis(defaults.retry_poll_interval),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl SupervisorSettings {
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            max_connection_age: Duration::from_millis(self.max_connection_age_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            max_connect_attempts: self.max_connect_attempts,
            min_retry_gap: Duration::from_millis(self.min_retry_gap_ms),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            fast_probe_timeout: Duration::from_millis(self.fast_probe_timeout_ms),
            quick_connect_attempts: self.quick_connect_attempts,
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            monitor_error_interval: Duration::from_millis(self.monitor_error_interval_ms),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            retry_poll_interval: Duration::from_millis(self.retry_poll_interval_ms),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("treadlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("treadlink");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or write the defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Treadmill address, with the environment taking precedence over the file
    pub fn effective_address(&self) -> Result<PeripheralAddress> {
        let raw = std::env::var(ADDRESS_ENV).unwrap_or_else(|_| self.address.clone());
        PeripheralAddress::new(&raw).with_context(|| {
            format!(
                "No treadmill address configured (set it with `treadlink config set address <addr>` or {})",
                ADDRESS_ENV
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Set a config value. Does not save.
    ///
    /// Supervisor timings are checked together, so a value that would make
    /// `serve` refuse to start is rejected here and nothing changes.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        next.apply(key, value)?;
        next.supervisor
            .to_supervisor_config()
            .validate()
            .with_context(|| format!("Rejected {} = {}", key, value))?;
        *self = next;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "address" => {
                self.address = PeripheralAddress::new(value)
                    .context("Invalid address")?
                    .to_string();
            }
            "listen_addr" => {
                value
                    .parse::<std::net::SocketAddr>()
                    .context("Invalid socket address")?;
                self.listen_addr = value.to_string();
            }
            "log_level" => self.log_level = value.to_string(),
            "log_dir" => {
                self.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "simulate" => {
                self.simulate = value.parse().context("Invalid boolean value")?;
            }
            "request_timeout_secs" => {
                self.request_timeout_secs = value.parse().context("Invalid number")?;
            }
            "require_power" => {
                self.require_power = value.parse().context("Invalid boolean value")?;
            }
            "max_connect_attempts" => {
                self.supervisor.max_connect_attempts = value.parse().context("Invalid number")?;
            }
            "quick_connect_attempts" => {
                self.supervisor.quick_connect_attempts = value.parse().context("Invalid number")?;
            }
            other => {
                let slot = self
                    .supervisor_slot(other)
                    .ok_or_else(|| anyhow::anyhow!("Unknown config key: {}", key))?;
                *slot = value.parse().context("Invalid number of milliseconds")?;
            }
        }
        Ok(())
    }

    /// Set a value and persist it at `path`
    pub fn set_and_save(&mut self, key: &str, value: &str, path: &Path) -> Result<()> {
        self.set(key, value)?;
        self.save_to(path)
    }

    fn supervisor_slot(&mut self, key: &str) -> Option<&mut u64> {
        let s = &mut self.supervisor;
        let slot = match key {
            "connect_timeout_ms" => &mut s.connect_timeout_ms,
            "command_timeout_ms" => &mut s.command_timeout_ms,
            "disconnect_timeout_ms" => &mut s.disconnect_timeout_ms,
            "health_check_interval_ms" => &mut s.health_check_interval_ms,
            "max_connection_age_ms" => &mut s.max_connection_age_ms,
            "backoff_base_ms" => &mut s.backoff_base_ms,
            "backoff_cap_ms" => &mut s.backoff_cap_ms,
            "min_retry_gap_ms" => &mut s.min_retry_gap_ms,
            "scan_timeout_ms" => &mut s.scan_timeout_ms,
            "cache_ttl_ms" => &mut s.cache_ttl_ms,
            "fast_probe_timeout_ms" => &mut s.fast_probe_timeout_ms,
            "monitor_interval_ms" => &mut s.monitor_interval_ms,
            "monitor_error_interval_ms" => &mut s.monitor_error_interval_ms,
            "restart_delay_ms" => &mut s.restart_delay_ms,
            "retry_poll_interval_ms" => &mut s.retry_poll_interval_ms,
            _ => return None,
        };
        Some(slot)
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let s = &self.supervisor;
        vec![
            ("address".to_string(), self.address.clone()),
            ("listen_addr".to_string(), self.listen_addr.clone()),
            ("log_level".to_string(), self.log_level.clone()),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(console only)".to_string()),
            ),
            ("simulate".to_string(), self.simulate.to_string()),
            (
                "request_timeout_secs".to_string(),
                self.request_timeout_secs.to_string(),
            ),
            ("require_power".to_string(), self.require_power.to_string()),
            ("connect_timeout_ms".to_string(), s.connect_timeout_ms.to_string()),
            ("command_timeout_ms".to_string(), s.command_timeout_ms.to_string()),
            (
                "disconnect_timeout_ms".to_string(),
                s.disconnect_timeout_ms.to_string(),
            ),
            (
                "health_check_interval_ms".to_string(),
                s.health_check_interval_ms.to_string(),
            ),
            (
                "max_connection_age_ms".to_string(),
                s.max_connection_age_ms.to_string(),
            ),
            ("backoff_base_ms".to_string(), s.backoff_base_ms.to_string()),
            ("backoff_cap_ms".to_string(), s.backoff_cap_ms.to_string()),
            (
                "max_connect_attempts".to_string(),
                s.max_connect_attempts.to_string(),
            ),
            ("min_retry_gap_ms".to_string(), s.min_retry_gap_ms.to_string()),
            ("scan_timeout_ms".to_string(), s.scan_timeout_ms.to_string()),
            ("cache_ttl_ms".to_string(), s.cache_ttl_ms.to_string()),
            (
                "fast_probe_timeout_ms".to_string(),
                s.fast_probe_timeout_ms.to_string(),
            ),
            (
                "quick_connect_attempts".to_string(),
                s.quick_connect_attempts.to_string(),
            ),
            ("monitor_interval_ms".to_string(), s.monitor_interval_ms.to_string()),
            (
                "monitor_error_interval_ms".to_string(),
                s.monitor_error_interval_ms.to_string(),
            ),
            ("restart_delay_ms".to_string(), s.restart_delay_ms.to_string()),
            (
                "retry_poll_interval_ms".to_string(),
                s.retry_poll_interval_ms.to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:5678");
        assert!(!config.simulate);
        assert!(config.supervisor.to_supervisor_config().validate().is_ok());
    }

    #[test]
    fn test_load_creates_defaults() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("config.json");

        let config = Config::load_from(&path)?;
        assert!(path.exists());
        assert_eq!(config.log_level, "info");
        Ok(())
    }

    #[test]
    fn test_set_persists() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("config.json");

        let mut config = Config::load_from(&path)?;
        config.set_and_save("address", "aa:bb:cc:dd:ee:ff", &path)?;
        config.set_and_save("backoff_base_ms", "250", &path)?;

        let reloaded = Config::load_from(&path)?;
        assert_eq!(reloaded.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            reloaded.supervisor.to_supervisor_config().backoff_base,
            Duration::from_millis(250)
        );
        Ok(())
    }

    #[test]
    fn test_unknown_and_invalid_keys() {
        let mut config = Config::default();
        assert!(config.set("bootstrap_nodes", "x").is_err());
        assert!(config.set("simulate", "maybe").is_err());
        assert!(config.set("listen_addr", "not-an-addr").is_err());
        assert!(config.set("address", "  ").is_err());
        assert_eq!(config.get("nope"), None);
    }

    #[test]
    fn test_every_supervisor_timing_is_settable() -> Result<()> {
        let mut config = Config::default();
        config.set("fast_probe_timeout_ms", "750")?;
        config.set("quick_connect_attempts", "2")?;
        config.set("monitor_error_interval_ms", "20000")?;
        config.set("restart_delay_ms", "2500")?;
        config.set("retry_poll_interval_ms", "250")?;

        let supervisor = config.supervisor.to_supervisor_config();
        assert_eq!(supervisor.fast_probe_timeout, Duration::from_millis(750));
        assert_eq!(supervisor.quick_connect_attempts, 2);
        assert_eq!(supervisor.monitor_error_interval, Duration::from_secs(20));
        assert_eq!(supervisor.restart_delay, Duration::from_millis(2500));
        assert_eq!(supervisor.retry_poll_interval, Duration::from_millis(250));
        assert_eq!(config.get("restart_delay_ms").as_deref(), Some("2500"));
        Ok(())
    }

    #[test]
    fn test_timing_that_breaks_startup_is_rejected() -> Result<()> {
        let mut config = Config::default();

        // The fast probe (2s) may not outlast a single command
        let err = config.set("command_timeout_ms", "1500").unwrap_err();
        assert!(format!("{:#}", err).contains("fast_probe_timeout"));
        assert_eq!(config.supervisor.command_timeout_ms, 5000);

        config.set("fast_probe_timeout_ms", "1000")?;
        config.set("command_timeout_ms", "1500")?;
        assert!(config.supervisor.to_supervisor_config().validate().is_ok());

        assert!(config.set("quick_connect_attempts", "0").is_err());
        assert!(config.set("restart_delay_ms", "0").is_err());
        Ok(())
    }

    #[test]
    fn test_require_power_flag() -> Result<()> {
        let mut config = Config::default();
        assert!(!config.require_power);
        config.set("require_power", "true")?;
        assert!(config.require_power);
        assert!(config.set("require_power", "sometimes").is_err());
        Ok(())
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"address":"AA:BB"}"#).unwrap();
        assert_eq!(config.address, "AA:BB");
        assert_eq!(config.supervisor.max_connect_attempts, 5);
    }
}
