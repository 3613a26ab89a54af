//! Outbound commands queued for delivery on a device's next contact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "sent" => Ok(CommandStatus::Sent),
            "failed" => Ok(CommandStatus::Failed),
            other => Err(format!("unknown command status '{other}'")),
        }
    }
}

/// Command payloads, serialized with a `kind` tag for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// One byte per output, non-zero = driven high.
    SetOutputs { outputs: [u8; 16] },
    SetInputFlags { flags: [u8; 16] },
    FirmwarePush { version: String },
    SmsToDevice { text: String },
    MotorOn,
    MotorOff,
    Reset,
    Devinfo,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::SetOutputs { .. } => "set_outputs",
            CommandKind::SetInputFlags { .. } => "set_input_flags",
            CommandKind::FirmwarePush { .. } => "firmware_push",
            CommandKind::SmsToDevice { .. } => "sms_to_device",
            CommandKind::MotorOn => "motor_on",
            CommandKind::MotorOff => "motor_off",
            CommandKind::Reset => "reset",
            CommandKind::Devinfo => "devinfo",
        }
    }
}

/// A queued command row.  `status` moves pending -> sent atomically with the
/// wire write; failed writes leave it pending for the next contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub id: i64,
    pub imei: u64,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub fail_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_with_tag() {
        let k = CommandKind::FirmwarePush {
            version: "3.2.0".to_owned(),
        };
        let json = serde_json::to_string(&k).unwrap();
        assert!(json.contains("\"kind\":\"firmware_push\""));
        assert_eq!(serde_json::from_str::<CommandKind>(&json).unwrap(), k);
    }

    #[test]
    fn unit_kinds_round_trip() {
        for k in [
            CommandKind::MotorOn,
            CommandKind::MotorOff,
            CommandKind::Reset,
            CommandKind::Devinfo,
        ] {
            let json = serde_json::to_string(&k).unwrap();
            assert_eq!(serde_json::from_str::<CommandKind>(&json).unwrap(), k);
        }
    }
}
