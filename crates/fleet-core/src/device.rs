//! Device record and identity validation.
//!
//! A `Device` is the latest-known state of one field unit, keyed by IMEI.
//! All mutation goes through the gateway's registry so that per-device
//! updates stay serialized; nothing in here touches storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Smallest accepted IMEI (14 digits would be below this).
pub const IMEI_MIN: u64 = 10_000_000_000_000;
/// Largest accepted IMEI (15 digits).
pub const IMEI_MAX: u64 = 999_999_999_999_999;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("IMEI {0} outside the 15-digit device range")]
pub struct InvalidImei(pub u64);

/// Check an IMEI against the valid device range.
pub fn validate_imei(imei: u64) -> Result<u64, InvalidImei> {
    if (IMEI_MIN..=IMEI_MAX).contains(&imei) {
        Ok(imei)
    } else {
        Err(InvalidImei(imei))
    }
}

// ---------------------------------------------------------------------------
// Protocol tag
// ---------------------------------------------------------------------------

/// Wire protocol a device speaks.  Fixed at creation, from the listener the
/// first login arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Wialon,
    Concox,
    Meiligao,
    Blu,
    Sgavl,
}

impl ProtocolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Wialon => "wialon",
            ProtocolKind::Concox => "concox",
            ProtocolKind::Meiligao => "meiligao",
            ProtocolKind::Blu => "blu",
            ProtocolKind::Sgavl => "sgavl",
        }
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wialon" => Ok(ProtocolKind::Wialon),
            "concox" => Ok(ProtocolKind::Concox),
            "meiligao" => Ok(ProtocolKind::Meiligao),
            "blu" => Ok(ProtocolKind::Blu),
            "sgavl" => Ok(ProtocolKind::Sgavl),
            other => Err(format!("unknown protocol tag '{other}'")),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnStatus {
    Online,
    Offline,
}

impl ConnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnStatus::Online => "ONLINE",
            ConnStatus::Offline => "OFFLINE",
        }
    }
}

impl std::str::FromStr for ConnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(ConnStatus::Online),
            "OFFLINE" => Ok(ConnStatus::Offline),
            other => Err(format!("unknown connection status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A WGS-84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Position {
        Position { lon, lat }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Latest-known state of one field unit.
///
/// Invariants (enforced by the gateway, not the type):
/// - `last_log` is monotonic non-decreasing.
/// - `position`/`speed`/`course`/`altitude` only advance from records whose
///   timestamp is >= the current `last_log`.
/// - `odometer_m` never decreases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub imei: u64,
    pub name: String,
    pub protocol: ProtocolKind,
    pub position: Option<Position>,
    /// km/h.
    pub speed: f64,
    /// Degrees clockwise from north.
    pub course: u16,
    /// Metres.
    pub altitude: i32,
    pub last_contact: DateTime<Utc>,
    /// Time of the newest device-generated record.
    pub last_log: DateTime<Utc>,
    pub status: ConnStatus,
    pub remote_addr: Option<SocketAddr>,
    pub firmware: String,
    /// Currently asserted alarm bits.
    pub alarms: u16,
    /// Which input bits are active-low alarm senses.
    pub alarm_mask: u16,
    pub inputs: u16,
    pub outputs: u16,
    pub odometer_m: u64,
    /// Connection quality, 0..=100.
    pub quality: u8,
    pub total_connections: u64,
    pub error_count: u64,
    /// Name of the wiring harness this device references.
    pub harness: String,
}

impl Device {
    /// A freshly created device, as auto-registered on first login.
    pub fn new(imei: u64, protocol: ProtocolKind, alarm_mask: u16, now: DateTime<Utc>) -> Device {
        Device {
            imei,
            name: imei.to_string(),
            protocol,
            position: None,
            speed: 0.0,
            course: 0,
            altitude: 0,
            last_contact: now,
            last_log: now,
            status: ConnStatus::Offline,
            remote_addr: None,
            firmware: String::new(),
            alarms: 0,
            alarm_mask,
            inputs: 0,
            outputs: 0,
            odometer_m: 0,
            quality: 0,
            total_connections: 0,
            error_count: 0,
            harness: "default".to_owned(),
        }
    }
}
