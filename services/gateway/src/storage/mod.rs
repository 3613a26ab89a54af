//! Storage contract and its SQLite implementation.
//!
//! The [`Storage`] trait is the only interface the gateway shares with the
//! surrounding system: device rows, the append-only event log, queued
//! commands, harnesses, UDP pseudo-sessions, and the SMS outbox.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON.  `PRAGMA integrity_check` runs at open; a failure is
//! fatal at startup (exit code 3).
//!
//! Track events carry a partial unique index on `(imei, ts)` so replaying
//! the same fix stores exactly one row regardless of retries.

use crate::session::UdpSession;
use chrono::{DateTime, Utc};
use fleet_core::{
    CommandKind, CommandStatus, ConnStatus, Device, Event, EventKind, EventPayload, Harness,
    OutboundCommand, Position, ProtocolKind,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The contract the gateway core has with the surrounding system.
pub trait Storage: Send {
    fn find_device(&self, imei: u64) -> StorageResult<Option<Device>>;
    fn create_device(&mut self, device: &Device) -> StorageResult<()>;
    /// Write-through of the mutable state fields.
    fn update_device(&mut self, device: &Device) -> StorageResult<()>;
    fn list_online_devices(&self) -> StorageResult<Vec<Device>>;

    /// Single-transaction append of mixed event variants.  Returns the
    /// number of rows actually stored (Track replays dedup to zero).
    fn append_events(&mut self, batch: &[Event]) -> StorageResult<usize>;
    fn get_latest_event(&self, imei: u64, kind: EventKind) -> StorageResult<Option<Event>>;

    fn list_pending_commands(&self, imei: u64) -> StorageResult<Vec<OutboundCommand>>;
    fn has_pending_command(&self, imei: u64, kind_name: &str) -> StorageResult<bool>;
    fn enqueue_command(&mut self, imei: u64, kind: &CommandKind) -> StorageResult<i64>;
    fn mark_command_sent(&mut self, id: i64, at: DateTime<Utc>) -> StorageResult<()>;
    fn mark_command_failed(&mut self, id: i64, reason: &str) -> StorageResult<()>;

    fn get_harness(&self, name: &str) -> StorageResult<Option<Harness>>;
    /// Idempotent; safe to call on every startup.
    fn create_default_harness(&mut self) -> StorageResult<()>;
    fn get_default_harness(&mut self) -> StorageResult<Harness>;

    fn udp_session_by_id(&self, id: u32) -> StorageResult<Option<UdpSession>>;
    fn upsert_udp_session(&mut self, session: &UdpSession) -> StorageResult<()>;
    fn delete_udp_sessions_for(&mut self, imei: u64) -> StorageResult<()>;
    fn purge_expired_udp_sessions(&mut self, before: DateTime<Utc>) -> StorageResult<usize>;
    fn max_udp_session_id(&self) -> StorageResult<u32>;

    /// Hand a text to the out-of-band SMS deliverer.
    fn enqueue_sms(&mut self, imei: u64, text: &str) -> StorageResult<i64>;
}

/// Shared handle used by every worker task.  Storage is an external,
/// thread-safe service from the core's point of view; the mutex serializes
/// access to the single SQLite connection.
pub type SharedStorage = Arc<tokio::sync::Mutex<Box<dyn Storage>>>;

pub fn shared(store: impl Storage + 'static) -> SharedStorage {
    Arc::new(tokio::sync::Mutex::new(Box::new(store)))
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StorageResult<SqliteStore> {
        let conn = Connection::open(path)?;
        let store = SqliteStore { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> StorageResult<SqliteStore> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    pub fn integrity_check(&self) -> StorageResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StorageError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_pragmas(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA wal_autocheckpoint=1000; PRAGMA foreign_keys=ON;",
        )?;
        Ok(())
    }

    fn apply_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(raw: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRow(format!("timestamp '{raw}': {e}")))
}

fn device_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDevice> {
    Ok(RawDevice {
        imei: row.get(0)?,
        name: row.get(1)?,
        protocol: row.get(2)?,
        lon: row.get(3)?,
        lat: row.get(4)?,
        speed: row.get(5)?,
        course: row.get(6)?,
        altitude: row.get(7)?,
        last_contact: row.get(8)?,
        last_log: row.get(9)?,
        status: row.get(10)?,
        remote_addr: row.get(11)?,
        firmware: row.get(12)?,
        alarms: row.get(13)?,
        alarm_mask: row.get(14)?,
        inputs: row.get(15)?,
        outputs: row.get(16)?,
        odometer_m: row.get(17)?,
        quality: row.get(18)?,
        total_connections: row.get(19)?,
        error_count: row.get(20)?,
        harness: row.get(21)?,
    })
}

/// Intermediate row form; converted after the rusqlite borrow ends.
struct RawDevice {
    imei: i64,
    name: String,
    protocol: String,
    lon: Option<f64>,
    lat: Option<f64>,
    speed: f64,
    course: i64,
    altitude: i64,
    last_contact: String,
    last_log: String,
    status: String,
    remote_addr: Option<String>,
    firmware: String,
    alarms: i64,
    alarm_mask: i64,
    inputs: i64,
    outputs: i64,
    odometer_m: i64,
    quality: i64,
    total_connections: i64,
    error_count: i64,
    harness: String,
}

impl RawDevice {
    fn into_device(self) -> StorageResult<Device> {
        let protocol: ProtocolKind = self
            .protocol
            .parse()
            .map_err(StorageError::CorruptRow)?;
        let status: ConnStatus = self.status.parse().map_err(StorageError::CorruptRow)?;
        let remote_addr = match self.remote_addr {
            None => None,
            Some(raw) => Some(
                raw.parse()
                    .map_err(|e| StorageError::CorruptRow(format!("remote_addr '{raw}': {e}")))?,
            ),
        };
        let position = match (self.lon, self.lat) {
            (Some(lon), Some(lat)) => Some(Position::new(lon, lat)),
            _ => None,
        };
        Ok(Device {
            imei: self.imei as u64,
            name: self.name,
            protocol,
            position,
            speed: self.speed,
            course: self.course as u16,
            altitude: self.altitude as i32,
            last_contact: ts_from_sql(&self.last_contact)?,
            last_log: ts_from_sql(&self.last_log)?,
            status,
            remote_addr,
            firmware: self.firmware,
            alarms: self.alarms as u16,
            alarm_mask: self.alarm_mask as u16,
            inputs: self.inputs as u16,
            outputs: self.outputs as u16,
            odometer_m: self.odometer_m as u64,
            quality: self.quality as u8,
            total_connections: self.total_connections as u64,
            error_count: self.error_count as u64,
            harness: self.harness,
        })
    }
}

const DEVICE_COLUMNS: &str = "imei, name, protocol, lon, lat, speed, course, altitude, \
     last_contact, last_log, status, remote_addr, firmware, alarms, alarm_mask, inputs, \
     outputs, odometer_m, quality, total_connections, error_count, harness";

impl SqliteStore {
    fn write_device(&self, device: &Device, create: bool) -> StorageResult<()> {
        let sql = if create {
            format!(
                "INSERT INTO devices ({DEVICE_COLUMNS}) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)"
            )
        } else {
            "UPDATE devices SET name=?2, protocol=?3, lon=?4, lat=?5, speed=?6, course=?7, \
             altitude=?8, last_contact=?9, last_log=?10, status=?11, remote_addr=?12, \
             firmware=?13, alarms=?14, alarm_mask=?15, inputs=?16, outputs=?17, odometer_m=?18, \
             quality=?19, total_connections=?20, error_count=?21, harness=?22 WHERE imei=?1"
                .to_owned()
        };
        self.conn.execute(
            &sql,
            params![
                device.imei as i64,
                device.name,
                device.protocol.as_str(),
                device.position.map(|p| p.lon),
                device.position.map(|p| p.lat),
                device.speed,
                i64::from(device.course),
                i64::from(device.altitude),
                ts_to_sql(device.last_contact),
                ts_to_sql(device.last_log),
                device.status.as_str(),
                device.remote_addr.map(|a| a.to_string()),
                device.firmware,
                i64::from(device.alarms),
                i64::from(device.alarm_mask),
                i64::from(device.inputs),
                i64::from(device.outputs),
                device.odometer_m as i64,
                i64::from(device.quality),
                device.total_connections as i64,
                device.error_count as i64,
                device.harness,
            ],
        )?;
        Ok(())
    }

    fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RawEvent, String)> {
        Ok((
            RawEvent {
                imei: row.get(0)?,
                ts: row.get(1)?,
                lon: row.get(2)?,
                lat: row.get(3)?,
                speed: row.get(4)?,
                course: row.get::<_, Option<i64>>(5)?,
                altitude: row.get::<_, Option<i64>>(6)?,
                odometer_m: row.get::<_, Option<i64>>(7)?,
            },
            row.get(8)?,
        ))
    }
}

struct RawEvent {
    imei: i64,
    ts: String,
    lon: Option<f64>,
    lat: Option<f64>,
    speed: Option<f64>,
    course: Option<i64>,
    altitude: Option<i64>,
    odometer_m: Option<i64>,
}

impl RawEvent {
    fn into_event(self, payload_json: &str) -> StorageResult<Event> {
        let payload: EventPayload = serde_json::from_str(payload_json)?;
        let position = match (self.lon, self.lat) {
            (Some(lon), Some(lat)) => Some(Position::new(lon, lat)),
            _ => None,
        };
        Ok(Event {
            imei: self.imei as u64,
            timestamp: ts_from_sql(&self.ts)?,
            position,
            speed: self.speed,
            course: self.course.map(|c| c as u16),
            altitude: self.altitude.map(|a| a as i32),
            odometer_m: self.odometer_m.map(|o| o as u64),
            payload,
        })
    }
}

impl Storage for SqliteStore {
    fn find_device(&self, imei: u64) -> StorageResult<Option<Device>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE imei = ?1"),
                params![imei as i64],
                device_from_row,
            )
            .optional()?;
        raw.map(RawDevice::into_device).transpose()
    }

    fn create_device(&mut self, device: &Device) -> StorageResult<()> {
        self.write_device(device, true)
    }

    fn update_device(&mut self, device: &Device) -> StorageResult<()> {
        self.write_device(device, false)
    }

    fn list_online_devices(&self) -> StorageResult<Vec<Device>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE status = 'ONLINE' ORDER BY imei"
        ))?;
        let rows = stmt.query_map([], device_from_row)?;
        let mut devices = Vec::new();
        for raw in rows {
            devices.push(raw?.into_device()?);
        }
        Ok(devices)
    }

    fn append_events(&mut self, batch: &[Event]) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;
        let mut stored = 0;
        for event in batch {
            let payload = serde_json::to_string(&event.payload)?;
            // OR IGNORE implements the Track (imei, ts) duplicate policy.
            let n = tx.execute(
                "INSERT OR IGNORE INTO events \
                     (imei, kind, ts, lon, lat, speed, course, altitude, odometer_m, payload) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                params![
                    event.imei as i64,
                    event.kind().as_str(),
                    ts_to_sql(event.timestamp),
                    event.position.map(|p| p.lon),
                    event.position.map(|p| p.lat),
                    event.speed,
                    event.course.map(i64::from),
                    event.altitude.map(i64::from),
                    event.odometer_m.map(|o| o as i64),
                    payload,
                ],
            )?;
            stored += n;
        }
        tx.commit()?;
        Ok(stored)
    }

    fn get_latest_event(&self, imei: u64, kind: EventKind) -> StorageResult<Option<Event>> {
        let row = self
            .conn
            .query_row(
                "SELECT imei, ts, lon, lat, speed, course, altitude, odometer_m, payload \
                 FROM events WHERE imei = ?1 AND kind = ?2 ORDER BY ts DESC, id DESC LIMIT 1",
                params![imei as i64, kind.as_str()],
                Self::event_from_row,
            )
            .optional()?;
        row.map(|(raw, payload)| raw.into_event(&payload)).transpose()
    }

    fn list_pending_commands(&self, imei: u64) -> StorageResult<Vec<OutboundCommand>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, imei, payload, status, created_at, sent_at, fail_reason \
             FROM commands WHERE imei = ?1 AND status = 'pending' ORDER BY id",
        )?;
        let rows = stmt.query_map(params![imei as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;
        let mut commands = Vec::new();
        for row in rows {
            let (id, imei, payload, status, created_at, sent_at, fail_reason) = row?;
            let status: CommandStatus = status.parse().map_err(StorageError::CorruptRow)?;
            commands.push(OutboundCommand {
                id,
                imei: imei as u64,
                kind: serde_json::from_str(&payload)?,
                status,
                created_at: ts_from_sql(&created_at)?,
                sent_at: sent_at.as_deref().map(ts_from_sql).transpose()?,
                fail_reason,
            });
        }
        Ok(commands)
    }

    fn has_pending_command(&self, imei: u64, kind_name: &str) -> StorageResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM commands WHERE imei = ?1 AND kind = ?2 AND status = 'pending'",
            params![imei as i64, kind_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn enqueue_command(&mut self, imei: u64, kind: &CommandKind) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO commands (imei, kind, payload, status, created_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![
                imei as i64,
                kind.name(),
                serde_json::to_string(kind)?,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn mark_command_sent(&mut self, id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE commands SET status = 'sent', sent_at = ?2 WHERE id = ?1",
            params![id, ts_to_sql(at)],
        )?;
        Ok(())
    }

    fn mark_command_failed(&mut self, id: i64, reason: &str) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE commands SET status = 'failed', fail_reason = ?2 WHERE id = ?1",
            params![id, reason],
        )?;
        Ok(())
    }

    fn get_harness(&self, name: &str) -> StorageResult<Option<Harness>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, input_names, output_names, input_config FROM harnesses WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((name, inputs, outputs, config)) => Ok(Some(Harness {
                name,
                input_names: serde_json::from_str(&inputs)?,
                output_names: serde_json::from_str(&outputs)?,
                input_config: serde_json::from_str(&config)?,
            })),
        }
    }

    fn create_default_harness(&mut self) -> StorageResult<()> {
        let harness = Harness::default_harness();
        self.conn.execute(
            "INSERT OR IGNORE INTO harnesses (name, input_names, output_names, input_config) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                harness.name,
                serde_json::to_string(&harness.input_names)?,
                serde_json::to_string(&harness.output_names)?,
                serde_json::to_string(&harness.input_config)?,
            ],
        )?;
        Ok(())
    }

    fn get_default_harness(&mut self) -> StorageResult<Harness> {
        if let Some(harness) = self.get_harness("default")? {
            return Ok(harness);
        }
        self.create_default_harness()?;
        self.get_harness("default")?
            .ok_or_else(|| StorageError::CorruptRow("default harness missing".to_owned()))
    }

    fn udp_session_by_id(&self, id: u32) -> StorageResult<Option<UdpSession>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, imei, addr, expires, last_seq FROM udp_sessions WHERE id = ?1",
                params![i64::from(id)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, imei, addr, expires, last_seq)) => Ok(Some(UdpSession {
                id: id as u32,
                imei: imei as u64,
                addr: addr
                    .parse()
                    .map_err(|e| StorageError::CorruptRow(format!("addr '{addr}': {e}")))?,
                expires: ts_from_sql(&expires)?,
                last_seq: last_seq as u64,
            })),
        }
    }

    fn upsert_udp_session(&mut self, session: &UdpSession) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO udp_sessions (id, imei, addr, expires, last_seq) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                i64::from(session.id),
                session.imei as i64,
                session.addr.to_string(),
                ts_to_sql(session.expires),
                session.last_seq as i64,
            ],
        )?;
        Ok(())
    }

    fn delete_udp_sessions_for(&mut self, imei: u64) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM udp_sessions WHERE imei = ?1",
            params![imei as i64],
        )?;
        Ok(())
    }

    fn purge_expired_udp_sessions(&mut self, before: DateTime<Utc>) -> StorageResult<usize> {
        let n = self.conn.execute(
            "DELETE FROM udp_sessions WHERE expires < ?1",
            params![ts_to_sql(before)],
        )?;
        Ok(n)
    }

    fn max_udp_session_id(&self) -> StorageResult<u32> {
        let max: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM udp_sessions", [], |row| {
                row.get(0)
            })?;
        Ok(max as u32)
    }

    fn enqueue_sms(&mut self, imei: u64, text: &str) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO sms_outbox (imei, text, created_at) VALUES (?1, ?2, ?3)",
            params![imei as i64, text, ts_to_sql(Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}
