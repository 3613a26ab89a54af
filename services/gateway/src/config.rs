//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides and no
//! hot reload.  Default config path: `/etc/fleet-gateway/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has defaults: the five protocol listeners on their
//! standard ports, the timeout/limit table from the protocol contract, an
//! empty firmware auto-push map, and alarm mask `0x0141` for new devices.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub storage: StorageConfig,
    pub listeners: ListenersConfig,
    pub timeouts: TimeoutsConfig,
    pub limits: LimitsConfig,
    pub firmware: FirmwareConfig,
    pub devices: DevicesConfig,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ListenersConfig {
    pub wialon: ListenerConfig,
    pub concox: ListenerConfig,
    pub meiligao: ListenerConfig,
    pub sgavl: ListenerConfig,
    pub blu: ListenerConfig,
}

#[derive(Debug, Clone)]
pub struct TimeoutsConfig {
    /// UDP session idle expiry (default 10 h).
    pub udp_session_ttl: Duration,
    /// ONLINE -> OFFLINE after this much silence (default 5 min).
    pub heartbeat_timeout: Duration,
    /// BLU devices ping more often; they get a tighter window (default 2 min).
    pub heartbeat_timeout_blu: Duration,
    /// Liveness sweep cadence (default 60 s).
    pub heartbeat_interval: Duration,
    /// Per-TCP-connection receive timeout (default 45 s).
    pub recv_timeout: Duration,
    /// Days outside `now` beyond which device timestamps are replaced.
    pub time_skew_tolerance_days: i64,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_frame_bytes_ascii: usize,
    pub max_frame_bytes_binary: usize,
}

#[derive(Debug, Clone)]
pub struct FirmwareConfig {
    /// Directory holding firmware images, `<version>.bin` each.
    pub dir: PathBuf,
    /// bad-version -> target-version; empty disables auto-push.
    pub autopush: HashMap<String, String>,
}

impl FirmwareConfig {
    /// Read-only `<version> -> path` lookup.
    pub fn firmware_path(&self, version: &str) -> PathBuf {
        self.dir.join(format!("{version}.bin"))
    }
}

#[derive(Debug, Clone)]
pub struct DevicesConfig {
    /// 16-bit active-low alarm mask applied to new devices.
    pub alarm_mask_default: u16,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    storage: Option<RawStorageConfig>,
    listeners: Option<RawListenersConfig>,
    timeouts: Option<RawTimeoutsConfig>,
    limits: Option<RawLimitsConfig>,
    firmware: Option<RawFirmwareConfig>,
    devices: Option<RawDevicesConfig>,
}

#[derive(Debug, Deserialize)]
struct RawStorageConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawListenersConfig {
    wialon: Option<RawListenerConfig>,
    concox: Option<RawListenerConfig>,
    meiligao: Option<RawListenerConfig>,
    sgavl: Option<RawListenerConfig>,
    blu: Option<RawListenerConfig>,
}

#[derive(Debug, Deserialize)]
struct RawListenerConfig {
    bind: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawTimeoutsConfig {
    udp_session_ttl_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    heartbeat_timeout_blu_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    recv_timeout_secs: Option<u64>,
    time_skew_tolerance_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawLimitsConfig {
    max_frame_bytes_ascii: Option<usize>,
    max_frame_bytes_binary: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawFirmwareConfig {
    dir: Option<String>,
    autopush: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawDevicesConfig {
    alarm_mask_default: Option<u16>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path `/etc/fleet-gateway/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/fleet-gateway/gateway.toml"))
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let storage = StorageConfig {
        sqlite_path: raw
            .storage
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/fleet-gateway/gateway.sqlite3".to_owned()),
    };

    let raw_listeners = raw.listeners;
    let listener = |pick: fn(&RawListenersConfig) -> Option<&RawListenerConfig>,
                    default_bind: &str| {
        let entry = raw_listeners.as_ref().and_then(pick);
        ListenerConfig {
            bind: entry
                .and_then(|l| l.bind.clone())
                .unwrap_or_else(|| default_bind.to_owned()),
            enabled: entry.and_then(|l| l.enabled).unwrap_or(true),
        }
    };
    let listeners = ListenersConfig {
        wialon: listener(|l| l.wialon.as_ref(), "0.0.0.0:20332"),
        concox: listener(|l| l.concox.as_ref(), "0.0.0.0:55300"),
        meiligao: listener(|l| l.meiligao.as_ref(), "0.0.0.0:62000"),
        sgavl: listener(|l| l.sgavl.as_ref(), "0.0.0.0:15557"),
        blu: listener(|l| l.blu.as_ref(), "0.0.0.0:60001"),
    };

    let t = raw.timeouts;
    let secs = |v: Option<u64>, default: u64| Duration::from_secs(v.unwrap_or(default));
    let timeouts = TimeoutsConfig {
        udp_session_ttl: secs(t.as_ref().and_then(|t| t.udp_session_ttl_secs), 36_000),
        heartbeat_timeout: secs(t.as_ref().and_then(|t| t.heartbeat_timeout_secs), 300),
        heartbeat_timeout_blu: secs(t.as_ref().and_then(|t| t.heartbeat_timeout_blu_secs), 120),
        heartbeat_interval: secs(t.as_ref().and_then(|t| t.heartbeat_interval_secs), 60),
        recv_timeout: secs(t.as_ref().and_then(|t| t.recv_timeout_secs), 45),
        time_skew_tolerance_days: t
            .as_ref()
            .and_then(|t| t.time_skew_tolerance_days)
            .unwrap_or(20),
    };
    if timeouts.time_skew_tolerance_days <= 0 {
        return Err(ConfigError::InvalidValue(
            "time_skew_tolerance_days must be positive".to_owned(),
        ));
    }

    let limits = LimitsConfig {
        max_frame_bytes_ascii: raw
            .limits
            .as_ref()
            .and_then(|l| l.max_frame_bytes_ascii)
            .unwrap_or(2048),
        max_frame_bytes_binary: raw
            .limits
            .as_ref()
            .and_then(|l| l.max_frame_bytes_binary)
            .unwrap_or(4096),
    };

    let firmware = match raw.firmware {
        Some(f) => FirmwareConfig {
            dir: PathBuf::from(
                f.dir
                    .unwrap_or_else(|| "/var/lib/fleet-gateway/firmware".to_owned()),
            ),
            autopush: f.autopush.unwrap_or_default(),
        },
        None => FirmwareConfig {
            dir: PathBuf::from("/var/lib/fleet-gateway/firmware"),
            autopush: HashMap::new(),
        },
    };

    let devices = DevicesConfig {
        alarm_mask_default: raw
            .devices
            .and_then(|d| d.alarm_mask_default)
            .unwrap_or(0x0141),
    };

    Ok(GatewayConfig {
        schema_version,
        storage,
        listeners,
        timeouts,
        limits,
        firmware,
        devices,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
