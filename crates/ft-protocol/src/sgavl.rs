//! SGAvl legacy binary codec.
//!
//! A connection opens with the 8-byte little-endian IMEI, then carries
//! records framed as `seq(4) len(2) type(1) body`.  All multi-byte fields
//! are little-endian.  Record decoding is table-driven: `decoder_for` maps
//! a record id to its decoder function; ids `0xA0..=0xBF` encode the
//! delta-fix count in the id itself.
//!
//! Server replies are `A0 <nRecords>` with optional command blocks
//! appended: `C0 <16 outputs>`, `C1 <16 input flags>`, `C2` (firmware-push
//! marker), `C3 <len> <ascii message>`.

use crate::record::{Fix, Record};
use crate::DecodeError;
use chrono::{TimeZone, Utc};
use fleet_core::{GsmKind, Position};

pub const REPLY_ACK: u8 = 0xA0;
pub const BLOCK_SET_OUTPUTS: u8 = 0xC0;
pub const BLOCK_SET_INPUT_FLAGS: u8 = 0xC1;
pub const BLOCK_FIRMWARE_PUSH: u8 = 0xC2;
pub const BLOCK_MESSAGE: u8 = 0xC3;

const COORD_SCALE: f64 = 10_000_000.0;
const FULL_FIX_LEN: usize = 16;
const DELTA_FIX_LEN: usize = 9;

// ---------------------------------------------------------------------------
// Record decoding
// ---------------------------------------------------------------------------

type RecordDecoder = fn(u8, &[u8]) -> Result<Vec<Record>, DecodeError>;

/// Decoder table keyed by record id.
fn decoder_for(id: u8) -> Option<RecordDecoder> {
    match id {
        0xA0..=0xBF => Some(decode_gps_block),
        0x02 | 0x03 => Some(decode_io_snapshot),
        0x04 | 0x05 => Some(decode_validity_fix),
        0x06 | 0x08 => Some(decode_state_fix),
        0x07 | 0x09 => Some(decode_state_time),
        0x10 => Some(decode_call),
        0x11 => Some(decode_sms),
        0x12 | 0x13 => Some(decode_reset),
        0x20 => Some(decode_pressure),
        0x21 => Some(decode_people),
        0x22 | 0x23 => Some(decode_alarm),
        _ => None,
    }
}

/// Decode one record body.  Unknown ids are reported, not fatal — the
/// caller logs and skips per the decode policy.
pub fn decode_record(id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    match decoder_for(id) {
        Some(decoder) => decoder(id, body),
        None => Err(DecodeError::UnknownRecordId(id)),
    }
}

/// Raw fix fields, kept in wire units so delta accumulation stays exact.
#[derive(Debug, Clone, Copy)]
struct RawFix {
    time: i64,
    lat: i32,
    lon: i32,
    alt: i16,
    speed: u8,
    course: u8,
}

impl RawFix {
    fn parse(raw: &[u8]) -> RawFix {
        RawFix {
            time: i64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            lat: i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            lon: i32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            alt: i16::from_le_bytes([raw[12], raw[13]]),
            speed: raw[14],
            course: raw[15],
        }
    }

    fn apply_delta(self, d: &[u8]) -> RawFix {
        RawFix {
            time: self.time + i64::from(i16::from_le_bytes([d[0], d[1]])),
            lat: self.lat + i32::from(i16::from_le_bytes([d[2], d[3]])),
            lon: self.lon + i32::from(i16::from_le_bytes([d[4], d[5]])),
            alt: self.alt + i16::from(d[6] as i8),
            speed: d[7],
            course: d[8],
        }
    }

    fn to_fix(self, gps_valid: bool) -> Result<Fix, DecodeError> {
        let time = Utc
            .timestamp_opt(self.time, 0)
            .single()
            .ok_or(DecodeError::FieldRange("time"))?;
        Ok(Fix {
            time,
            position: Position::new(
                f64::from(self.lon) / COORD_SCALE,
                f64::from(self.lat) / COORD_SCALE,
            ),
            speed: f64::from(self.speed),
            course: (u16::from(self.course) * 360) / 256,
            altitude: i32::from(self.alt),
            satellites: None,
            hdop: None,
            gps_valid,
        })
    }
}

/// `0xA0 + n`: one full fix followed by n delta fixes.
fn decode_gps_block(id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let deltas = usize::from(id - 0xA0);
    if body.len() != FULL_FIX_LEN + deltas * DELTA_FIX_LEN {
        return Err(DecodeError::Truncated);
    }
    let mut raw = RawFix::parse(&body[..FULL_FIX_LEN]);
    let mut records = Vec::with_capacity(1 + deltas);
    records.push(Record::Track(raw.to_fix(true)?));
    for chunk in body[FULL_FIX_LEN..].chunks_exact(DELTA_FIX_LEN) {
        raw = raw.apply_delta(chunk);
        records.push(Record::Track(raw.to_fix(true)?));
    }
    Ok(records)
}

/// `0x02` without fix / `0x03` with trailing fix.
fn decode_io_snapshot(id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let with_fix = id == 0x03;
    let expected = if with_fix { 4 + FULL_FIX_LEN } else { 4 };
    if body.len() != expected {
        return Err(DecodeError::Truncated);
    }
    let inputs = u16::from_le_bytes([body[0], body[1]]);
    let outputs = u16::from_le_bytes([body[2], body[3]]);
    let fix = if with_fix {
        Some(RawFix::parse(&body[4..]).to_fix(true)?)
    } else {
        None
    };
    Ok(vec![Record::IoSnapshot {
        inputs,
        outputs: Some(outputs),
        fix,
    }])
}

/// `0x04` GPS-lost / `0x05` GPS-OK.
fn decode_validity_fix(id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.len() != FULL_FIX_LEN {
        return Err(DecodeError::Truncated);
    }
    let fix = RawFix::parse(body).to_fix(id == 0x05)?;
    Ok(vec![Record::Track(fix)])
}

/// `0x06` login fix / `0x08` logout fix.
fn decode_state_fix(_id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.len() != FULL_FIX_LEN {
        return Err(DecodeError::Truncated);
    }
    Ok(vec![Record::Track(RawFix::parse(body).to_fix(true)?)])
}

/// `0x07` login time / `0x09` logout time.
fn decode_state_time(_id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.len() != 4 {
        return Err(DecodeError::Truncated);
    }
    let secs = i64::from(u32::from_le_bytes([body[0], body[1], body[2], body[3]]));
    let time = Utc
        .timestamp_opt(secs, 0)
        .single()
        .ok_or(DecodeError::FieldRange("time"))?;
    Ok(vec![Record::TimeMark { time }])
}

fn decode_call(_id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let peer = ascii_text(body)?;
    Ok(vec![Record::Gsm {
        direction: GsmKind::Call,
        peer,
        text: None,
    }])
}

/// `[phone_len] [phone] [text…]`.
fn decode_sms(_id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let phone_len = usize::from(*body.first().ok_or(DecodeError::Truncated)?);
    if body.len() < 1 + phone_len {
        return Err(DecodeError::Truncated);
    }
    let peer = ascii_text(&body[1..1 + phone_len])?;
    let text = ascii_text(&body[1 + phone_len..])?;
    Ok(vec![Record::Gsm {
        direction: GsmKind::Sms,
        peer,
        text: Some(text),
    }])
}

/// `0x12` reason + free text / `0x13` reason only.
fn decode_reset(id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let reason = *body.first().ok_or(DecodeError::Truncated)?;
    let detail = if id == 0x12 {
        Some(ascii_text(&body[1..])?)
    } else {
        if body.len() != 1 {
            return Err(DecodeError::Truncated);
        }
        None
    };
    Ok(vec![Record::Reset { reason, detail }])
}

fn decode_pressure(_id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.len() != 5 {
        return Err(DecodeError::Truncated);
    }
    Ok(vec![Record::Pressure {
        sensor_id: sensor_id24(body),
        value: u16::from_le_bytes([body[3], body[4]]),
    }])
}

fn decode_people(_id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.len() != 7 {
        return Err(DecodeError::Truncated);
    }
    Ok(vec![Record::PeopleCount {
        sensor_id: Some(sensor_id24(body)),
        entered: u16::from_le_bytes([body[3], body[4]]),
        exited: u16::from_le_bytes([body[5], body[6]]),
        time: None,
    }])
}

/// `0x22` alarm start / `0x23` alarm stop.
fn decode_alarm(id: u8, body: &[u8]) -> Result<Vec<Record>, DecodeError> {
    if body.len() != 3 {
        return Err(DecodeError::Truncated);
    }
    Ok(vec![Record::Alarm {
        sensor_id: sensor_id24(body),
        active: id == 0x22,
    }])
}

fn sensor_id24(body: &[u8]) -> u32 {
    u32::from_le_bytes([body[0], body[1], body[2], 0])
}

fn ascii_text(raw: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| DecodeError::BadText)
}

// ---------------------------------------------------------------------------
// Server replies
// ---------------------------------------------------------------------------

/// Command blocks appended to the record acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBlock {
    SetOutputs([u8; 16]),
    SetInputFlags([u8; 16]),
    FirmwarePush,
    Message(String),
}

/// `A0 <nRecords>` plus any queued command blocks.
pub fn encode_reply(acked_records: u8, blocks: &[CommandBlock]) -> Vec<u8> {
    let mut out = vec![REPLY_ACK, acked_records];
    for block in blocks {
        match block {
            CommandBlock::SetOutputs(bytes) => {
                out.push(BLOCK_SET_OUTPUTS);
                out.extend_from_slice(bytes);
            }
            CommandBlock::SetInputFlags(bytes) => {
                out.push(BLOCK_SET_INPUT_FLAGS);
                out.extend_from_slice(bytes);
            }
            CommandBlock::FirmwarePush => out.push(BLOCK_FIRMWARE_PUSH),
            CommandBlock::Message(text) => {
                let ascii = text.as_bytes();
                let len = ascii.len().min(usize::from(u8::MAX));
                out.push(BLOCK_MESSAGE);
                out.push(len as u8);
                out.extend_from_slice(&ascii[..len]);
            }
        }
    }
    out
}

/// Parse a server reply back into blocks (round-trip/test support).
pub fn decode_reply(raw: &[u8]) -> Result<(u8, Vec<CommandBlock>), DecodeError> {
    if raw.len() < 2 || raw[0] != REPLY_ACK {
        return Err(DecodeError::Truncated);
    }
    let acked = raw[1];
    let mut blocks = Vec::new();
    let mut at = 2;
    while at < raw.len() {
        match raw[at] {
            BLOCK_SET_OUTPUTS | BLOCK_SET_INPUT_FLAGS => {
                let end = at + 17;
                if raw.len() < end {
                    return Err(DecodeError::Truncated);
                }
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&raw[at + 1..end]);
                blocks.push(if raw[at] == BLOCK_SET_OUTPUTS {
                    CommandBlock::SetOutputs(bytes)
                } else {
                    CommandBlock::SetInputFlags(bytes)
                });
                at = end;
            }
            BLOCK_FIRMWARE_PUSH => {
                blocks.push(CommandBlock::FirmwarePush);
                at += 1;
            }
            BLOCK_MESSAGE => {
                let len = usize::from(*raw.get(at + 1).ok_or(DecodeError::Truncated)?);
                let end = at + 2 + len;
                if raw.len() < end {
                    return Err(DecodeError::Truncated);
                }
                blocks.push(CommandBlock::Message(ascii_text(&raw[at + 2..end])?));
                at = end;
            }
            other => return Err(DecodeError::UnknownRecordId(other)),
        }
    }
    Ok((acked, blocks))
}

// ---------------------------------------------------------------------------
// Encoding helpers (test/emulation support)
// ---------------------------------------------------------------------------

pub fn encode_login(imei: u64) -> [u8; 8] {
    imei.to_le_bytes()
}

/// `seq(4) len(2) type(1) body` record framing.
pub fn encode_record(seq: u32, id: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + body.len());
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.push(id);
    out.extend_from_slice(body);
    out
}

pub fn encode_full_fix(time: u32, lat: i32, lon: i32, alt: i16, speed: u8, course: u8) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&time.to_le_bytes());
    out[4..8].copy_from_slice(&lat.to_le_bytes());
    out[8..12].copy_from_slice(&lon.to_le_bytes());
    out[12..14].copy_from_slice(&alt.to_le_bytes());
    out[14] = speed;
    out[15] = course;
    out
}

pub fn encode_delta_fix(dt: i16, dlat: i16, dlon: i16, dalt: i8, speed: u8, course: u8) -> [u8; 9] {
    let mut out = [0u8; 9];
    out[0..2].copy_from_slice(&dt.to_le_bytes());
    out[2..4].copy_from_slice(&dlat.to_le_bytes());
    out[4..6].copy_from_slice(&dlon.to_le_bytes());
    out[6] = dalt as u8;
    out[7] = speed;
    out[8] = course;
    out
}
