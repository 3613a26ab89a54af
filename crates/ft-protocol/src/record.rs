//! Typed records decoded from wire frames.
//!
//! A frame may carry several records (SGAvl GPS blocks, BLU data packets);
//! the codecs flatten them into `Vec<Record>` so the ingestion pipeline can
//! treat every protocol uniformly.

use chrono::{DateTime, Utc};
use fleet_core::{GsmKind, Position};

/// A full position fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub time: DateTime<Utc>,
    pub position: Position,
    /// km/h.
    pub speed: f64,
    /// Degrees clockwise from north.
    pub course: u16,
    /// Metres.
    pub altitude: i32,
    pub satellites: Option<u8>,
    pub hdop: Option<f64>,
    /// False when the device flagged the fix as stale (GPS lost).
    pub gps_valid: bool,
}

impl Fix {
    pub fn new(time: DateTime<Utc>, position: Position) -> Fix {
        Fix {
            time,
            position,
            speed: 0.0,
            course: 0,
            altitude: 0,
            satellites: None,
            hdop: None,
            gps_valid: true,
        }
    }
}

/// One logical unit decoded from a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Device identification.  `password` only exists on Wialon.
    Login {
        imei: u64,
        password: Option<String>,
    },
    /// Keep-alive with no payload.
    Ping,
    /// A GPS position fix.
    Track(Fix),
    /// Current IO state.  `outputs` is `None` for protocols that only
    /// report inputs.  The pipeline diffs this against the device state and
    /// emits an IO-change event only when bits actually changed.
    IoSnapshot {
        inputs: u16,
        outputs: Option<u16>,
        fix: Option<Fix>,
    },
    /// Inbound call or SMS notification.
    Gsm {
        direction: GsmKind,
        peer: String,
        text: Option<String>,
    },
    /// Device-reported reset.
    Reset {
        reason: u8,
        detail: Option<String>,
    },
    /// Tyre/weight sensor reading.
    Pressure {
        sensor_id: u32,
        value: u16,
    },
    /// Door counter reading.
    PeopleCount {
        sensor_id: Option<u32>,
        entered: u16,
        exited: u16,
        time: Option<DateTime<Utc>>,
    },
    /// Sensor alarm start/stop.
    Alarm {
        sensor_id: u32,
        active: bool,
    },
    /// Device firmware/identity report.
    Devinfo {
        firmware: String,
    },
    /// A bare device-side timestamp marker (SGAvl login/logout times).
    /// Updates liveness only; no event is persisted.
    TimeMark {
        time: DateTime<Utc>,
    },
}
