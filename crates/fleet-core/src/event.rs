//! Persisted events.
//!
//! Events are append-only: the gateway writes them in per-frame batches and
//! never mutates them afterwards.  The kind-specific payload serializes with
//! a top-level `kind` tag so the storage layer can keep it as one JSON
//! column next to the common attributes.

use crate::device::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Track,
    IoChange,
    Gsm,
    Reset,
    Pressure,
    PeopleCount,
    Alarm,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Track => "track",
            EventKind::IoChange => "io_change",
            EventKind::Gsm => "gsm",
            EventKind::Reset => "reset",
            EventKind::Pressure => "pressure",
            EventKind::PeopleCount => "people_count",
            EventKind::Alarm => "alarm",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "track" => Ok(EventKind::Track),
            "io_change" => Ok(EventKind::IoChange),
            "gsm" => Ok(EventKind::Gsm),
            "reset" => Ok(EventKind::Reset),
            "pressure" => Ok(EventKind::Pressure),
            "people_count" => Ok(EventKind::PeopleCount),
            "alarm" => Ok(EventKind::Alarm),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GsmKind {
    Call,
    Sms,
}

/// Kind-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Track {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        satellites: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hdop: Option<f64>,
    },
    IoChange {
        inputs: u16,
        outputs: u16,
        /// Human-readable change log, e.g. `"IN3=ON, OUT1=OFF"`.
        changes: String,
    },
    Gsm {
        direction: GsmKind,
        peer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Reset {
        reason: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Pressure {
        sensor_id: u32,
        value: u16,
    },
    PeopleCount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sensor_id: Option<u32>,
        entered: u16,
        exited: u16,
    },
    Alarm {
        sensor_id: u32,
        active: bool,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Track { .. } => EventKind::Track,
            EventPayload::IoChange { .. } => EventKind::IoChange,
            EventPayload::Gsm { .. } => EventKind::Gsm,
            EventPayload::Reset { .. } => EventKind::Reset,
            EventPayload::Pressure { .. } => EventKind::Pressure,
            EventPayload::PeopleCount { .. } => EventKind::PeopleCount,
            EventPayload::Alarm { .. } => EventKind::Alarm,
        }
    }
}

/// One persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub imei: u64,
    /// UTC, already sanitized against the skew window.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odometer_m: Option<u64>,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_kind_tag() {
        let p = EventPayload::IoChange {
            inputs: 0x0005,
            outputs: 0x0001,
            changes: "IN1=ON, IN3=ON".to_owned(),
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"kind\":\"io_change\""));
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn kind_string_round_trips() {
        for k in [
            EventKind::Track,
            EventKind::IoChange,
            EventKind::Gsm,
            EventKind::Reset,
            EventKind::Pressure,
            EventKind::PeopleCount,
            EventKind::Alarm,
        ] {
            assert_eq!(k.as_str().parse::<EventKind>().unwrap(), k);
        }
    }
}
