//! Treadmill-facing value types
//!
//! Addresses, discovery results and the decoded status record that the
//! peripheral client hands back to the supervisor and the command façade.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Stable hardware address of the target peripheral.
///
/// Stored upper-cased so that discovery results reported in either case
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeripheralAddress(String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Peripheral address cannot be empty")]
    Empty,
}

impl PeripheralAddress {
    /// Create a new address, normalising case and surrounding whitespace
    pub fn new(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeripheralAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeripheralAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PeripheralAddress> for String {
    fn from(address: PeripheralAddress) -> Self {
        address.0
    }
}

/// A device seen during a discovery scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub address: PeripheralAddress,
    pub name: Option<String>,
    /// Received signal strength in dBm, when the radio reports it
    pub rssi: Option<i16>,
}

/// Operating mode of the treadmill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PadMode {
    Standby,
    Manual,
    Auto,
}

impl PadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PadMode::Standby => "standby",
            PadMode::Manual => "manual",
            PadMode::Auto => "auto",
        }
    }
}

impl fmt::Display for PadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Mode {0} not supported")]
pub struct UnknownMode(pub String);

impl FromStr for PadMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standby" => Ok(PadMode::Standby),
            "manual" => Ok(PadMode::Manual),
            "auto" => Ok(PadMode::Auto),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

/// Belt state as reported in the status record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeltState {
    Idle,
    Running,
    Standby,
    Starting,
    Unknown(u8),
}

impl BeltState {
    /// Decode the raw belt byte: 0 idle, 1 running, 5 standby, 7 and up starting
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => BeltState::Idle,
            1 => BeltState::Running,
            5 => BeltState::Standby,
            7..=u8::MAX => BeltState::Starting,
            other => BeltState::Unknown(other),
        }
    }

    pub fn label(&self) -> String {
        match self {
            BeltState::Idle => "idle".to_string(),
            BeltState::Running => "running".to_string(),
            BeltState::Standby => "standby".to_string(),
            BeltState::Starting => "starting".to_string(),
            BeltState::Unknown(raw) => format!("unknown({})", raw),
        }
    }
}

/// Raw status fields in device units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawStatus {
    pub mode: u8,
    pub belt_state: u8,
    /// Distance in units of 10 metres
    pub dist: u32,
    /// Elapsed time in seconds
    pub time: u32,
    pub steps: u32,
    /// Speed in units of 0.1 km/h
    pub speed: u16,
}

/// Decoded treadmill status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadStatus {
    pub mode: Option<PadMode>,
    pub belt_state: BeltState,
    pub distance_km: f64,
    pub time_secs: u32,
    pub steps: u32,
    pub speed_kmh: f64,
}

impl PadStatus {
    pub fn from_raw(raw: RawStatus) -> Self {
        let mode = match raw.mode {
            0 => Some(PadMode::Auto),
            1 => Some(PadMode::Manual),
            2 => Some(PadMode::Standby),
            _ => None,
        };

        Self {
            mode,
            belt_state: BeltState::from_raw(raw.belt_state),
            distance_km: f64::from(raw.dist) / 100.0,
            time_secs: raw.time,
            steps: raw.steps,
            speed_kmh: f64::from(raw.speed) / 10.0,
        }
    }

    /// Summary suitable for storing a finished walk
    pub fn workout(&self) -> WorkoutSummary {
        WorkoutSummary {
            steps: self.steps,
            distance_km: self.distance_km,
            duration_secs: self.time_secs,
        }
    }
}

/// The figures persisted after a walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkoutSummary {
    pub steps: u32,
    pub distance_km: f64,
    pub duration_secs: u32,
}

impl WorkoutSummary {
    /// Whole minutes, truncated
    pub fn duration_minutes(&self) -> u32 {
        self.duration_secs / 60
    }
}
