//! Platform clock helpers.
//!
//! Every timestamp that crosses a module boundary is a `DateTime<Tz>` in the
//! platform timezone. Naive inputs are read as platform wall-clock time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{CoreError, Result};

/// Fixed timezone of the platform (Rio de Janeiro local time).
pub const TIMEZONE: Tz = chrono_tz::America::Sao_Paulo;

/// Timestamp format exchanged with the orchestrator.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Convert any timezone-aware instant to the platform timezone.
pub fn to_platform<Z: TimeZone>(ts: &DateTime<Z>) -> DateTime<Tz> {
    ts.with_timezone(&TIMEZONE)
}

/// Attach the platform timezone to a wall-clock reading.
///
/// Ambiguous readings (DST fall-back) resolve to the earlier instant;
/// readings that do not exist (DST spring-forward gap) yield `None`.
pub fn localize(naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    TIMEZONE.from_local_datetime(&naive).earliest()
}

/// Parse an RFC 3339 instant (any offset) or a naive platform wall-clock
/// timestamp. A bare `YYYY-MM-DD` means local midnight.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Tz>> {
    let trimmed = value.trim();
    let invalid = || CoreError::InvalidTimestamp {
        value: value.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(to_platform(&dt));
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return localize(naive).ok_or_else(invalid);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
        return localize(midnight).ok_or_else(invalid);
    }

    Err(invalid())
}

/// Render `ts` as `YYYY-MM-DD HH:MM:SS` platform wall-clock time.
pub fn format_timestamp<Z: TimeZone>(ts: &DateTime<Z>) -> String {
    to_platform(ts).format(TIMESTAMP_FORMAT).to_string()
}

/// Timestamp of the current run: the explicit override when given, else the
/// orchestrator's scheduled start. Seconds and sub-seconds are dropped.
pub fn scheduled_timestamp(
    explicit: Option<&str>,
    scheduled_start: DateTime<Utc>,
) -> Result<DateTime<Tz>> {
    let ts = match explicit {
        Some(value) => parse_timestamp(value)?,
        None => to_platform(&scheduled_start),
    };
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .ok_or_else(|| CoreError::InvalidTimestamp {
            value: ts.to_rfc3339(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_is_converted_to_platform_time() {
        let ts = parse_timestamp("2024-03-10T12:00:00Z").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-10 09:00:00");
    }

    #[test]
    fn naive_input_is_platform_wall_clock() {
        let ts = parse_timestamp("2024-03-10 09:30:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-10T09:30:00-03:00");

        let with_t = parse_timestamp("2024-03-10T09:30").unwrap();
        assert_eq!(ts, with_t);
    }

    #[test]
    fn bare_date_means_midnight() {
        let ts = parse_timestamp("2024-03-10").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-10 00:00:00");
    }

    #[test]
    fn garbage_is_rejected() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert_eq!(err.code(), "INVALID_TIMESTAMP");
    }

    #[test]
    fn scheduled_timestamp_truncates_seconds() {
        let scheduled = Utc.with_ymd_and_hms(2024, 3, 10, 15, 7, 42).unwrap();
        let ts = scheduled_timestamp(None, scheduled).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-10 12:07:00");
    }

    #[test]
    fn explicit_timestamp_wins_over_schedule() {
        let scheduled = Utc.with_ymd_and_hms(2024, 3, 10, 15, 7, 42).unwrap();
        let ts = scheduled_timestamp(Some("2024-01-01 05:05:59"), scheduled).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-01 05:05:00");
    }
}
