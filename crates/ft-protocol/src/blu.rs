//! BLU UDP codec.
//!
//! One datagram is one frame; the packet-type byte at offset 0 selects the
//! layout.  Devices are connectionless, so the server assigns a 32-bit
//! session id at login and every later packet carries it.
//!
//! Inbound: `01` login (8-byte LE IMEI + 6-byte MAC), `02` ping (session),
//! `03` devinfo response (session + firmware string), `04` data (session +
//! CRC-16/AUG-CCITT + records).  Outbound: `10 <session:u32> <cmd:u8>` and
//! the bare `11` re-login prompt.
//!
//! Data records are `id(4) size(4)` headers plus body, all little-endian.
//! Track entries are 14 bytes; the inputs byte carries the IO-delta marker
//! in bit 7 and the motor/ignition/panic/charger/power signals in bits 0-4.

use crate::crc::crc_aug_ccitt;
use crate::record::{Fix, Record};
use crate::{DecodeError, FrameError};
use chrono::{TimeZone, Utc};
use fleet_core::Position;

pub const PKT_LOGIN: u8 = 0x01;
pub const PKT_PING: u8 = 0x02;
pub const PKT_DEVINFO: u8 = 0x03;
pub const PKT_DATA: u8 = 0x04;
pub const PKT_SESSION: u8 = 0x10;
pub const PKT_RELOGIN: u8 = 0x11;

pub const CMD_REQUEST_DEVINFO: u8 = 0x20;
pub const CMD_DATA_OK: u8 = 0x21;
pub const CMD_RESET: u8 = 0x22;
pub const CMD_MOTOR_ON: u8 = 0x23;
pub const CMD_MOTOR_OFF: u8 = 0x24;

pub const REC_TRACK: u32 = 0x30;
pub const REC_PEOPLE: u32 = 0x31;

/// Bit 7 of the inputs byte: this entry also carries an IO delta.
pub const INPUT_DELTA_BIT: u8 = 0x80;
/// Low five bits: motor, ignition, panic, charger, power.
pub const INPUT_SIGNAL_MASK: u8 = 0x1F;

const COORD_SCALE: f64 = 10_000_000.0;
const TRACK_ENTRY_LEN: usize = 14;
const RECORD_HEADER_LEN: usize = 8;

/// A record still in wire form; decode with [`decode_record`] so the caller
/// can skip unknown ids without dropping the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BluPacket {
    Login { imei: u64, mac: [u8; 6] },
    Ping { session: u32 },
    DevinfoResponse { session: u32, firmware: String },
    Data { session: u32, records: Vec<RawRecord> },
}

/// Full validation; `validate(d)` is exactly `decode(d).is_ok()`.
pub fn validate(datagram: &[u8]) -> bool {
    decode(datagram).is_ok()
}

pub fn decode(datagram: &[u8]) -> Result<BluPacket, DecodeError> {
    match *datagram.first().ok_or(FrameError::Short)? {
        PKT_LOGIN => {
            if datagram.len() != 15 {
                return Err(FrameError::BadLength.into());
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&datagram[1..9]);
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&datagram[9..15]);
            Ok(BluPacket::Login {
                imei: u64::from_le_bytes(raw),
                mac,
            })
        }
        PKT_PING => {
            if datagram.len() != 5 {
                return Err(FrameError::BadLength.into());
            }
            Ok(BluPacket::Ping {
                session: session_id(&datagram[1..5]),
            })
        }
        PKT_DEVINFO => {
            if datagram.len() < 6 {
                return Err(FrameError::BadLength.into());
            }
            let len = usize::from(datagram[5]);
            if datagram.len() != 6 + len {
                return Err(FrameError::BadLength.into());
            }
            let firmware = std::str::from_utf8(&datagram[6..])
                .map_err(|_| DecodeError::BadText)?
                .to_owned();
            Ok(BluPacket::DevinfoResponse {
                session: session_id(&datagram[1..5]),
                firmware,
            })
        }
        PKT_DATA => {
            if datagram.len() < 7 {
                return Err(FrameError::BadLength.into());
            }
            let session = session_id(&datagram[1..5]);
            let expected = u16::from_le_bytes([datagram[5], datagram[6]]);
            let payload = &datagram[7..];
            if crc_aug_ccitt(payload) != expected {
                return Err(FrameError::BadChecksum.into());
            }
            Ok(BluPacket::Data {
                session,
                records: split_records(payload)?,
            })
        }
        _ => Err(FrameError::BadPreamble.into()),
    }
}

fn session_id(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

fn split_records(mut payload: &[u8]) -> Result<Vec<RawRecord>, DecodeError> {
    let mut records = Vec::new();
    while !payload.is_empty() {
        if payload.len() < RECORD_HEADER_LEN {
            return Err(FrameError::BadLength.into());
        }
        let id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let size = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
        let end = RECORD_HEADER_LEN + size;
        if payload.len() < end {
            return Err(FrameError::BadLength.into());
        }
        records.push(RawRecord {
            id,
            body: payload[RECORD_HEADER_LEN..end].to_vec(),
        });
        payload = &payload[end..];
    }
    Ok(records)
}

/// Decode one data record.  Unknown ids are reported so the caller can log
/// and skip without dropping the rest of the datagram.
pub fn decode_record(id: u32, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    match id {
        REC_TRACK => decode_track_entries(body),
        REC_PEOPLE => decode_people(body),
        other => Err(DecodeError::UnknownRecordId((other & 0xFF) as u8)),
    }
}

/// 14-byte entries: time(4) lat(4) lon(4) speed(1) inputs(1).
fn decode_track_entries(body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.is_empty() || body.len() % TRACK_ENTRY_LEN != 0 {
        return Err(DecodeError::Truncated);
    }
    let mut records = Vec::new();
    for entry in body.chunks_exact(TRACK_ENTRY_LEN) {
        let secs = i64::from(u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]));
        let time = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or(DecodeError::FieldRange("time"))?;
        let lat = i32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
        let lon = i32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
        let inputs = entry[13];
        records.push(Record::Track(Fix {
            time,
            position: Position::new(f64::from(lon) / COORD_SCALE, f64::from(lat) / COORD_SCALE),
            speed: f64::from(entry[12]),
            course: 0,
            altitude: 0,
            satellites: None,
            hdop: None,
            gps_valid: true,
        }));
        if inputs & INPUT_DELTA_BIT != 0 {
            records.push(Record::IoSnapshot {
                inputs: u16::from(inputs & INPUT_SIGNAL_MASK),
                outputs: None,
                fix: None,
            });
        }
    }
    Ok(records)
}

/// time(4) entered(2) exited(2).
fn decode_people(body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.len() != 8 {
        return Err(DecodeError::Truncated);
    }
    let secs = i64::from(u32::from_le_bytes([body[0], body[1], body[2], body[3]]));
    let time = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or(DecodeError::FieldRange("time"))?;
    Ok(vec![Record::PeopleCount {
        sensor_id: None,
        entered: u16::from_le_bytes([body[4], body[5]]),
        exited: u16::from_le_bytes([body[6], body[7]]),
        time: Some(time),
    }])
}

// ---------------------------------------------------------------------------
// Server datagrams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerDatagram {
    Session { session: u32, cmd: u8 },
    Relogin,
}

pub fn encode_session_reply(session: u32, cmd: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.push(PKT_SESSION);
    out.extend_from_slice(&session.to_le_bytes());
    out.push(cmd);
    out
}

pub fn encode_relogin() -> Vec<u8> {
    vec![PKT_RELOGIN]
}

/// Round-trip support for the outbound datagrams.
pub fn decode_server_datagram(raw: &[u8]) -> Result<ServerDatagram, DecodeError> {
    match *raw.first().ok_or(FrameError::Short)? {
        PKT_SESSION if raw.len() == 6 => Ok(ServerDatagram::Session {
            session: session_id(&raw[1..5]),
            cmd: raw[5],
        }),
        PKT_RELOGIN if raw.len() == 1 => Ok(ServerDatagram::Relogin),
        _ => Err(FrameError::BadLength.into()),
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers (test/emulation support)
// ---------------------------------------------------------------------------

pub fn encode_login(imei: u64, mac: [u8; 6]) -> Vec<u8> {
    let mut out = Vec::with_capacity(15);
    out.push(PKT_LOGIN);
    out.extend_from_slice(&imei.to_le_bytes());
    out.extend_from_slice(&mac);
    out
}

pub fn encode_ping(session: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(PKT_PING);
    out.extend_from_slice(&session.to_le_bytes());
    out
}

pub fn encode_devinfo_response(session: u32, firmware: &str) -> Vec<u8> {
    let ascii = firmware.as_bytes();
    let mut out = Vec::with_capacity(6 + ascii.len());
    out.push(PKT_DEVINFO);
    out.extend_from_slice(&session.to_le_bytes());
    out.push(ascii.len() as u8);
    out.extend_from_slice(ascii);
    out
}

pub fn encode_data(session: u32, records: &[RawRecord]) -> Vec<u8> {
    let mut payload = Vec::new();
    for record in records {
        payload.extend_from_slice(&record.id.to_le_bytes());
        payload.extend_from_slice(&(record.body.len() as u32).to_le_bytes());
        payload.extend_from_slice(&record.body);
    }
    let mut out = Vec::with_capacity(7 + payload.len());
    out.push(PKT_DATA);
    out.extend_from_slice(&session.to_le_bytes());
    out.extend_from_slice(&crc_aug_ccitt(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

pub fn encode_track_entry(time: u32, lat: i32, lon: i32, speed: u8, inputs: u8) -> [u8; 14] {
    let mut out = [0u8; 14];
    out[0..4].copy_from_slice(&time.to_le_bytes());
    out[4..8].copy_from_slice(&lat.to_le_bytes());
    out[8..12].copy_from_slice(&lon.to_le_bytes());
    out[12] = speed;
    out[13] = inputs;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_round_trip() {
        let wire = encode_login(123_456_789_012_345, [1, 2, 3, 4, 5, 6]);
        assert_eq!(
            decode(&wire).unwrap(),
            BluPacket::Login {
                imei: 123_456_789_012_345,
                mac: [1, 2, 3, 4, 5, 6]
            }
        );
    }

    #[test]
    fn ping_round_trip() {
        assert_eq!(
            decode(&encode_ping(0xDEAD_BEEF)).unwrap(),
            BluPacket::Ping {
                session: 0xDEAD_BEEF
            }
        );
    }

    #[test]
    fn devinfo_round_trip() {
        assert_eq!(
            decode(&encode_devinfo_response(9, "fw-3.1.7")).unwrap(),
            BluPacket::DevinfoResponse {
                session: 9,
                firmware: "fw-3.1.7".to_owned()
            }
        );
    }

    #[test]
    fn data_packet_crc_and_records() {
        let entry = encode_track_entry(1_751_108_919, 569_461_000, 241_053_000, 42, 0x03);
        let wire = encode_data(
            7,
            &[RawRecord {
                id: REC_TRACK,
                body: entry.to_vec(),
            }],
        );
        let BluPacket::Data { session, records } = decode(&wire).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(session, 7);
        assert_eq!(records.len(), 1);

        let decoded = decode_record(records[0].id, &records[0].body).unwrap();
        assert_eq!(decoded.len(), 1);
        let Record::Track(fix) = &decoded[0] else {
            panic!("expected track");
        };
        assert!((fix.position.lat - 56.946_1).abs() < 1e-7);
        assert!((fix.speed - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn corrupt_crc_rejected() {
        let entry = encode_track_entry(1_751_108_919, 0, 0, 0, 0);
        let mut wire = encode_data(
            7,
            &[RawRecord {
                id: REC_TRACK,
                body: entry.to_vec(),
            }],
        );
        wire[5] ^= 0xFF;
        assert_eq!(
            decode(&wire).unwrap_err(),
            DecodeError::Frame(FrameError::BadChecksum)
        );
        assert!(!validate(&wire));
    }

    #[test]
    fn delta_bit_emits_io_snapshot() {
        let entry = encode_track_entry(1_751_108_919, 0, 0, 0, INPUT_DELTA_BIT | 0x02);
        let decoded = decode_record(REC_TRACK, &entry).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(
            decoded[1],
            Record::IoSnapshot {
                inputs: 0x02,
                outputs: None,
                fix: None
            }
        );
    }

    #[test]
    fn people_counter_record() {
        let mut body = 1_751_108_919u32.to_le_bytes().to_vec();
        body.extend_from_slice(&3u16.to_le_bytes());
        body.extend_from_slice(&1u16.to_le_bytes());
        let decoded = decode_record(REC_PEOPLE, &body).unwrap();
        let Record::PeopleCount {
            entered, exited, ..
        } = &decoded[0]
        else {
            panic!("expected people count");
        };
        assert_eq!((*entered, *exited), (3, 1));
    }

    #[test]
    fn server_datagram_round_trip() {
        for cmd in [
            CMD_REQUEST_DEVINFO,
            CMD_DATA_OK,
            CMD_RESET,
            CMD_MOTOR_ON,
            CMD_MOTOR_OFF,
        ] {
            let wire = encode_session_reply(41, cmd);
            assert_eq!(
                decode_server_datagram(&wire).unwrap(),
                ServerDatagram::Session { session: 41, cmd }
            );
        }
        assert_eq!(
            decode_server_datagram(&encode_relogin()).unwrap(),
            ServerDatagram::Relogin
        );
    }

    #[test]
    fn empty_datagram_is_short() {
        assert_eq!(
            decode(&[]).unwrap_err(),
            DecodeError::Frame(FrameError::Short)
        );
    }
}
