//! Concox/Meiligao binary codec.
//!
//! Frame: `78 78 | len | proto | body | serial(2) | CRC-ITU(2) | 0D 0A`,
//! all multi-byte integers big-endian.  The length byte counts protocol
//! byte + body + serial + CRC.  The CRC spans the length byte through the
//! serial.  Concox devices speak this over TCP; Meiligao units send the
//! identical format one frame per UDP datagram.
//!
//! Coordinates are signed 32-bit at 1/1,800,000 degree; speed is in tenths
//! of km/h.

use crate::crc::crc_itu;
use crate::record::{Fix, Record};
use crate::{DecodeError, FrameError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use fleet_core::Position;
use std::net::Ipv4Addr;

pub const PROTO_LOGIN: u8 = 0x01;
pub const PROTO_POSITION: u8 = 0x12;
pub const PROTO_STATUS: u8 = 0x13;
pub const PROTO_COMMAND: u8 = 0x80;

const COORD_SCALE: f64 = 1_800_000.0;
const POSITION_BODY_LEN: usize = 21;

/// A decoded frame: protocol byte, device serial (echoed in acks), payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcoxFrame {
    pub proto: u8,
    pub serial: u16,
    pub payload: ConcoxPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConcoxPayload {
    Login { imei: u64 },
    Position(Fix),
    Status { inputs: u16, outputs: u16 },
    Command(ConcoxCommand),
}

/// Server-to-device commands (proto `0x80`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcoxCommand {
    SetInterval { seconds: u32 },
    SetIp { ip: Ipv4Addr, port: u16 },
}

const CMD_SET_INTERVAL: u8 = 0x01;
const CMD_SET_IP: u8 = 0x02;

impl ConcoxFrame {
    /// Flatten to pipeline records.  Commands decode to nothing — the
    /// server never ingests its own command frames.
    pub fn records(&self) -> Vec<Record> {
        match &self.payload {
            ConcoxPayload::Login { imei } => vec![Record::Login {
                imei: *imei,
                password: None,
            }],
            ConcoxPayload::Position(fix) => vec![Record::Track(*fix)],
            ConcoxPayload::Status { inputs, outputs } => vec![Record::IoSnapshot {
                inputs: *inputs,
                outputs: Some(*outputs),
                fix: None,
            }],
            ConcoxPayload::Command(_) => Vec::new(),
        }
    }
}

/// Full validation; `validate(f)` is exactly `decode(f).is_ok()`.
pub fn validate(frame: &[u8]) -> bool {
    decode(frame).is_ok()
}

pub fn decode(frame: &[u8]) -> Result<ConcoxFrame, DecodeError> {
    let (proto, body, serial) = split_frame(frame)?;
    let payload = match proto {
        PROTO_LOGIN => {
            if body.len() != 8 {
                return Err(DecodeError::Truncated);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(body);
            ConcoxPayload::Login {
                imei: u64::from_be_bytes(raw),
            }
        }
        PROTO_POSITION => ConcoxPayload::Position(decode_position(body)?),
        PROTO_STATUS => {
            if body.len() != 4 {
                return Err(DecodeError::Truncated);
            }
            ConcoxPayload::Status {
                inputs: u16::from_be_bytes([body[0], body[1]]),
                outputs: u16::from_be_bytes([body[2], body[3]]),
            }
        }
        PROTO_COMMAND => ConcoxPayload::Command(decode_command_body(body)?),
        other => return Err(DecodeError::UnknownRecordId(other)),
    };
    Ok(ConcoxFrame {
        proto,
        serial,
        payload,
    })
}

/// Structural checks shared by every frame: preamble, length, terminator,
/// CRC.  Returns (proto, body, serial).
fn split_frame(frame: &[u8]) -> Result<(u8, &[u8], u16), DecodeError> {
    if frame.len() < 10 {
        return Err(FrameError::Short.into());
    }
    if frame[0] != 0x78 || frame[1] != 0x78 {
        return Err(FrameError::BadPreamble.into());
    }
    let len = frame[2] as usize;
    if len < 5 || frame.len() != len + 5 {
        return Err(FrameError::BadLength.into());
    }
    if frame[frame.len() - 2] != 0x0D || frame[frame.len() - 1] != 0x0A {
        return Err(FrameError::BadTerminator.into());
    }
    let crc_at = frame.len() - 4;
    let expected = u16::from_be_bytes([frame[crc_at], frame[crc_at + 1]]);
    if crc_itu(&frame[2..crc_at]) != expected {
        return Err(FrameError::BadChecksum.into());
    }
    let serial = u16::from_be_bytes([frame[crc_at - 2], frame[crc_at - 1]]);
    Ok((frame[3], &frame[4..crc_at - 2], serial))
}

/// Body: datetime(6) sats(1) lat(4) lon(4) speed(2) course(2) altitude(2).
fn decode_position(body: &[u8]) -> Result<Fix, DecodeError> {
    if body.len() != POSITION_BODY_LEN {
        return Err(DecodeError::Truncated);
    }
    let time = decode_datetime(&body[0..6])?;
    let satellites = body[6];
    let lat = i32::from_be_bytes([body[7], body[8], body[9], body[10]]);
    let lon = i32::from_be_bytes([body[11], body[12], body[13], body[14]]);
    let speed = u16::from_be_bytes([body[15], body[16]]);
    let course = u16::from_be_bytes([body[17], body[18]]);
    if course >= 360 {
        return Err(DecodeError::FieldRange("course"));
    }
    let altitude = i16::from_be_bytes([body[19], body[20]]);
    Ok(Fix {
        time,
        position: Position::new(f64::from(lon) / COORD_SCALE, f64::from(lat) / COORD_SCALE),
        speed: f64::from(speed) / 10.0,
        course,
        altitude: i32::from(altitude),
        satellites: Some(satellites),
        hdop: None,
        gps_valid: true,
    })
}

/// `YY MM DD hh mm ss`, year 2000-based.
fn decode_datetime(raw: &[u8]) -> Result<DateTime<Utc>, DecodeError> {
    let date = NaiveDate::from_ymd_opt(
        2000 + i32::from(raw[0]),
        u32::from(raw[1]),
        u32::from(raw[2]),
    )
    .ok_or(DecodeError::FieldRange("date"))?;
    let time = NaiveTime::from_hms_opt(u32::from(raw[3]), u32::from(raw[4]), u32::from(raw[5]))
        .ok_or(DecodeError::FieldRange("time"))?;
    Ok(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

fn decode_command_body(body: &[u8]) -> Result<ConcoxCommand, DecodeError> {
    match body.first() {
        Some(&CMD_SET_INTERVAL) if body.len() == 5 => Ok(ConcoxCommand::SetInterval {
            seconds: u32::from_be_bytes([body[1], body[2], body[3], body[4]]),
        }),
        Some(&CMD_SET_IP) if body.len() == 7 => Ok(ConcoxCommand::SetIp {
            ip: Ipv4Addr::new(body[1], body[2], body[3], body[4]),
            port: u16::from_be_bytes([body[5], body[6]]),
        }),
        Some(&op) if op == CMD_SET_INTERVAL || op == CMD_SET_IP => Err(DecodeError::Truncated),
        Some(&op) => Err(DecodeError::UnknownRecordId(op)),
        None => Err(DecodeError::Truncated),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn build_frame(proto: u8, body: &[u8], serial: u16) -> Vec<u8> {
    let len = body.len() + 5;
    debug_assert!(len <= u8::MAX as usize);
    let mut out = Vec::with_capacity(len + 5);
    out.extend_from_slice(&[0x78, 0x78, len as u8, proto]);
    out.extend_from_slice(body);
    out.extend_from_slice(&serial.to_be_bytes());
    let crc = crc_itu(&out[2..]);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&[0x0D, 0x0A]);
    out
}

/// Empty-body acknowledgement echoing the request's protocol byte.
pub fn encode_ack(proto: u8, serial: u16) -> Vec<u8> {
    build_frame(proto, &[], serial)
}

pub fn encode_command(cmd: &ConcoxCommand, serial: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(7);
    match cmd {
        ConcoxCommand::SetInterval { seconds } => {
            body.push(CMD_SET_INTERVAL);
            body.extend_from_slice(&seconds.to_be_bytes());
        }
        ConcoxCommand::SetIp { ip, port } => {
            body.push(CMD_SET_IP);
            body.extend_from_slice(&ip.octets());
            body.extend_from_slice(&port.to_be_bytes());
        }
    }
    build_frame(PROTO_COMMAND, &body, serial)
}

/// Encode a login frame.  Devices send these; the server only needs this
/// for tests and emulation.
pub fn encode_login(imei: u64, serial: u16) -> Vec<u8> {
    build_frame(PROTO_LOGIN, &imei.to_be_bytes(), serial)
}

/// Encode a position frame from a fix (test/emulation support).
pub fn encode_position(fix: &Fix, serial: u16) -> Vec<u8> {
    use chrono::{Datelike, Timelike};
    let mut body = Vec::with_capacity(POSITION_BODY_LEN);
    let t = fix.time;
    body.extend_from_slice(&[
        (t.year() - 2000) as u8,
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
        fix.satellites.unwrap_or(0),
    ]);
    body.extend_from_slice(&((fix.position.lat * COORD_SCALE) as i32).to_be_bytes());
    body.extend_from_slice(&((fix.position.lon * COORD_SCALE) as i32).to_be_bytes());
    body.extend_from_slice(&((fix.speed * 10.0) as u16).to_be_bytes());
    body.extend_from_slice(&fix.course.to_be_bytes());
    body.extend_from_slice(&(fix.altitude as i16).to_be_bytes());
    build_frame(PROTO_POSITION, &body, serial)
}

/// Encode a status/heartbeat frame (test/emulation support).
pub fn encode_status(inputs: u16, outputs: u16, serial: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.extend_from_slice(&inputs.to_be_bytes());
    body.extend_from_slice(&outputs.to_be_bytes());
    build_frame(PROTO_STATUS, &body, serial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_round_trip() {
        let frame = encode_login(868_120_148_862_581, 1);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.proto, PROTO_LOGIN);
        assert_eq!(decoded.serial, 1);
        assert_eq!(
            decoded.payload,
            ConcoxPayload::Login {
                imei: 868_120_148_862_581
            }
        );
    }

    #[test]
    fn position_round_trip() {
        let fix = Fix {
            time: Utc.with_ymd_and_hms(2025, 6, 28, 11, 48, 39).unwrap(),
            position: Position::new(24.105_3, 56.946_1),
            speed: 12.3,
            course: 72,
            altitude: 31,
            satellites: Some(9),
            hdop: None,
            gps_valid: true,
        };
        let frame = encode_position(&fix, 7);
        let decoded = decode(&frame).unwrap();
        let ConcoxPayload::Position(out) = decoded.payload else {
            panic!("expected position");
        };
        assert!((out.position.lat - fix.position.lat).abs() < 1e-6);
        assert!((out.position.lon - fix.position.lon).abs() < 1e-6);
        assert!((out.speed - 12.3).abs() < 1e-9);
        assert_eq!(out.course, 72);
        assert_eq!(out.altitude, 31);
        assert_eq!(out.time, fix.time);
    }

    #[test]
    fn command_round_trips() {
        let commands = [
            ConcoxCommand::SetInterval { seconds: 30 },
            ConcoxCommand::SetIp {
                ip: Ipv4Addr::new(10, 0, 42, 7),
                port: 55_300,
            },
        ];
        for cmd in commands {
            let frame = encode_command(&cmd, 99);
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded.payload, ConcoxPayload::Command(cmd));
            assert_eq!(decoded.serial, 99);
        }
    }

    #[test]
    fn corrupt_crc_is_bad_checksum() {
        let mut frame = encode_login(868_120_148_862_581, 1);
        let crc_at = frame.len() - 4;
        frame[crc_at] ^= 0xFF;
        assert_eq!(
            decode(&frame).unwrap_err(),
            DecodeError::Frame(FrameError::BadChecksum)
        );
        assert!(!validate(&frame));
    }

    #[test]
    fn truncated_frame_is_short() {
        assert_eq!(
            decode(&[0x78, 0x78, 0x05]).unwrap_err(),
            DecodeError::Frame(FrameError::Short)
        );
    }

    #[test]
    fn ack_echoes_protocol_byte() {
        let ack = encode_ack(PROTO_STATUS, 3);
        let decoded = split_frame(&ack).unwrap();
        assert_eq!(decoded.0, PROTO_STATUS);
        assert_eq!(decoded.1.len(), 0);
        assert_eq!(decoded.2, 3);
    }
}
