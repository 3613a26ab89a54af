//! Device timestamp sanitization.
//!
//! Field units drift, lose RTC batteries, and occasionally report garbage
//! like 1970 or 2099.  A record timestamp outside the skew window is
//! replaced with the server clock; the record itself is kept.

use chrono::{DateTime, Duration, Utc};

/// Unix-seconds floor below which a device clock is considered unset.
pub const EPOCH_FLOOR_SECS: i64 = 10_000;

/// Replace `ts` with `now` when it is below the epoch floor or more than
/// `tolerance_days` away from `now` in either direction.
pub fn sanitize_timestamp(
    ts: DateTime<Utc>,
    now: DateTime<Utc>,
    tolerance_days: i64,
) -> DateTime<Utc> {
    if ts.timestamp() < EPOCH_FLOOR_SECS {
        return now;
    }
    let window = Duration::days(tolerance_days);
    if ts < now - window || ts > now + window {
        now
    } else {
        ts
    }
}
