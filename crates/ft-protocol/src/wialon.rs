//! Wialon ASCII codec.
//!
//! Frames are `#<TYPE>#<fields…>` lines, CRLF-terminated on the wire (the
//! framer strips the CRLF).  Supported inbound types: `L` (login), `D`
//! (data), `SD` (short data), `P` (ping).  Server replies use the same
//! scheme: `#AL#`, `#AD#`, `#ASD#`, `#AP#`.
//!
//! Coordinates are NMEA-style: whole degrees and decimal minutes in
//! separate fields, with a hemisphere letter.  An empty or `NA` hemisphere
//! is treated as positive.

use crate::record::{Fix, Record};
use crate::{DecodeError, FrameError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use fleet_core::Position;

pub const ACK_LOGIN_OK: &str = "#AL#1\r\n";
pub const ACK_LOGIN_FAIL: &str = "#AL#0\r\n";
pub const ACK_DATA_OK: &str = "#AD#1\r\n";
pub const ACK_DATA_FAIL: &str = "#AD#0\r\n";
pub const ACK_SHORT_DATA_OK: &str = "#ASD#1\r\n";
pub const ACK_PING: &str = "#AP#\r\n";

const DATA_FIELDS: usize = 18;
const SHORT_DATA_FIELDS: usize = 12;

/// A decoded Wialon frame.  Data frames flatten to records so the pipeline
/// sees the same shapes as the binary protocols.
#[derive(Debug, Clone, PartialEq)]
pub enum WialonFrame {
    Login { imei: u64, password: String },
    Data(Vec<Record>),
    ShortData(Vec<Record>),
    Ping,
}

/// Full validation; `validate(f)` is exactly `decode(f).is_ok()`.
pub fn validate(line: &str) -> bool {
    decode(line).is_ok()
}

pub fn decode(line: &str) -> Result<WialonFrame, DecodeError> {
    let rest = line
        .strip_prefix('#')
        .ok_or(DecodeError::Frame(FrameError::BadPreamble))?;
    let sep = rest
        .find('#')
        .ok_or(DecodeError::Frame(FrameError::BadPreamble))?;
    let (kind, body) = (&rest[..sep], &rest[sep + 1..]);

    match kind {
        "L" => decode_login(body),
        "D" => Ok(WialonFrame::Data(decode_data(body)?)),
        "SD" => Ok(WialonFrame::ShortData(decode_short_data(body)?)),
        "P" => Ok(WialonFrame::Ping),
        _ => Err(DecodeError::Frame(FrameError::BadPreamble)),
    }
}

fn decode_login(body: &str) -> Result<WialonFrame, DecodeError> {
    let mut parts = body.splitn(2, ';');
    let imei = parts
        .next()
        .unwrap_or("")
        .parse::<u64>()
        .map_err(|_| DecodeError::FieldRange("imei"))?;
    let password = parts.next().unwrap_or("").to_owned();
    Ok(WialonFrame::Login { imei, password })
}

fn decode_data(body: &str) -> Result<Vec<Record>, DecodeError> {
    let f: Vec<&str> = body.split(';').collect();
    if f.len() != DATA_FIELDS {
        return Err(DecodeError::FieldRange("field count"));
    }
    let fix = parse_fix(&f)?;
    let inputs = parse_mask(f[13])?;
    let outputs = parse_mask(f[14])?;
    // f[15] adc, f[16] ibutton, f[17] params: carried on the wire but not
    // part of the device state model.
    Ok(vec![
        Record::Track(fix),
        Record::IoSnapshot {
            inputs,
            outputs: Some(outputs),
            fix: None,
        },
    ])
}

fn decode_short_data(body: &str) -> Result<Vec<Record>, DecodeError> {
    let f: Vec<&str> = body.split(';').collect();
    if f.len() != SHORT_DATA_FIELDS {
        return Err(DecodeError::FieldRange("field count"));
    }
    Ok(vec![Record::Track(parse_fix(&f)?)])
}

/// Parse the common 12-field prefix shared by `#D#` and `#SD#`.
fn parse_fix(f: &[&str]) -> Result<Fix, DecodeError> {
    let time = parse_date_time(f[0], f[1])?;
    let lat = parse_coord(f[2], f[3], f[4], 'S', "lat")?;
    let lon = parse_coord(f[5], f[6], f[7], 'W', "lon")?;
    let speed = parse_num(f[8]).unwrap_or(0.0);
    let course = parse_num(f[9]).unwrap_or(0.0);
    if !(0.0..360.0).contains(&course) {
        return Err(DecodeError::FieldRange("course"));
    }
    let altitude = parse_num(f[10]).unwrap_or(0.0);
    let satellites = parse_num(f[11]).map(|v| v as u8);
    let hdop = f.get(12).and_then(|s| parse_num(s));
    Ok(Fix {
        time,
        position: Position::new(lon, lat),
        speed,
        course: course as u16,
        altitude: altitude as i32,
        satellites,
        hdop,
        gps_valid: true,
    })
}

/// `DDMMYY` + `HHMMSS` to UTC.
fn parse_date_time(date: &str, time: &str) -> Result<DateTime<Utc>, DecodeError> {
    if date.len() != 6 || time.len() != 6 {
        return Err(DecodeError::FieldRange("datetime"));
    }
    let two = |s: &str, at: usize| -> Result<u32, DecodeError> {
        s[at..at + 2]
            .parse::<u32>()
            .map_err(|_| DecodeError::FieldRange("datetime"))
    };
    let d = NaiveDate::from_ymd_opt(2000 + two(date, 4)? as i32, two(date, 2)?, two(date, 0)?)
        .ok_or(DecodeError::FieldRange("date"))?;
    let t = NaiveTime::from_hms_opt(two(time, 0)?, two(time, 2)?, two(time, 4)?)
        .ok_or(DecodeError::FieldRange("time"))?;
    Ok(Utc.from_utc_datetime(&NaiveDateTime::new(d, t)))
}

/// Degrees + decimal minutes + hemisphere letter to signed decimal degrees.
fn parse_coord(
    deg: &str,
    minutes: &str,
    hemi: &str,
    negative: char,
    field: &'static str,
) -> Result<f64, DecodeError> {
    let deg: f64 = deg.parse().map_err(|_| DecodeError::FieldRange(field))?;
    let minutes: f64 = minutes.parse().map_err(|_| DecodeError::FieldRange(field))?;
    if !(0.0..60.0).contains(&minutes) || deg < 0.0 {
        return Err(DecodeError::FieldRange(field));
    }
    let value = deg + minutes / 60.0;
    // Empty and "NA" hemispheres read as positive.
    if hemi.len() == 1 && hemi.starts_with(negative) {
        Ok(-value)
    } else {
        Ok(value)
    }
}

/// Numeric field; empty and `NA` read as absent.
fn parse_num(s: &str) -> Option<f64> {
    if s.is_empty() || s == "NA" {
        None
    } else {
        s.parse().ok()
    }
}

/// Bitmask field; empty and `NA` read as zero.
fn parse_mask(s: &str) -> Result<u16, DecodeError> {
    if s.is_empty() || s == "NA" {
        return Ok(0);
    }
    s.parse().map_err(|_| DecodeError::FieldRange("io mask"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &str = "#D#280625;114839;10;9.69;N;68;0.02;W;12.0;72;0;8;1.0;0;0;0;00;NA";

    #[test]
    fn login_frame() {
        let f = decode("#L#123456789012345;pw").unwrap();
        assert_eq!(
            f,
            WialonFrame::Login {
                imei: 123_456_789_012_345,
                password: "pw".to_owned()
            }
        );
    }

    #[test]
    fn data_frame_coordinates_and_speed() {
        let WialonFrame::Data(records) = decode(DATA).unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(records.len(), 2);
        let Record::Track(fix) = &records[0] else {
            panic!("expected track first");
        };
        assert!((fix.position.lat - 10.1615).abs() < 1e-6, "{}", fix.position.lat);
        assert!((fix.position.lon + 68.000_333).abs() < 1e-5, "{}", fix.position.lon);
        assert!((fix.speed - 12.0).abs() < f64::EPSILON);
        assert_eq!(fix.course, 72);
        assert_eq!(fix.satellites, Some(8));
        assert_eq!(fix.time.to_rfc3339(), "2025-06-28T11:48:39+00:00");
        assert_eq!(
            records[1],
            Record::IoSnapshot {
                inputs: 0,
                outputs: Some(0),
                fix: None
            }
        );
    }

    #[test]
    fn na_hemisphere_reads_positive() {
        let line = "#SD#280625;114839;10;9.69;NA;68;0.02;NA;12.0;72;0;8";
        let WialonFrame::ShortData(records) = decode(line).unwrap() else {
            panic!("expected short data");
        };
        let Record::Track(fix) = &records[0] else {
            panic!("expected track");
        };
        assert!(fix.position.lat > 0.0);
        assert!(fix.position.lon > 0.0);
    }

    #[test]
    fn ping_frame() {
        assert_eq!(decode("#P#").unwrap(), WialonFrame::Ping);
    }

    #[test]
    fn unknown_type_is_a_framing_error() {
        assert!(!validate("#Q#x"));
        assert_eq!(
            decode("#Q#x").unwrap_err(),
            DecodeError::Frame(FrameError::BadPreamble)
        );
    }

    #[test]
    fn wrong_field_count_rejected() {
        assert!(!validate("#D#280625;114839;10"));
    }

    #[test]
    fn bad_minutes_rejected() {
        let line = "#SD#280625;114839;10;61.0;N;68;0.02;W;12.0;72;0;8";
        assert_eq!(decode(line).unwrap_err(), DecodeError::FieldRange("lat"));
    }

    #[test]
    fn validate_matches_decode() {
        for line in ["#L#123456789012345;pw", DATA, "#P#", "#D#zzz", "no-hash"] {
            assert_eq!(validate(line), decode(line).is_ok(), "{line}");
        }
    }
}
