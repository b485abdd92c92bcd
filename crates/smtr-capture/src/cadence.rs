use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{CaptureError, Result};

/// Daily cadence used for date-partitioned sources without an explicit cron.
pub const DAILY_CRON: &str = "0 0 * * *";
/// Hourly cadence used for hour-partitioned sources without an explicit cron.
pub const HOURLY_CRON: &str = "0 * * * *";

/// Longest clock jump a tick may fall into.
const MAX_GAP_MINUTES: i64 = 180;

/// A cron-driven sequence of expected capture instants.
///
/// Ticks are evaluated in the platform timezone, so `0 0 * * *` means local
/// midnight regardless of the host clock.
#[derive(Debug, Clone)]
pub struct Cadence {
    expression: String,
    schedule: Schedule,
}

impl Cadence {
    /// Parse a 5-field (minute precision) or 6/7-field (with seconds) cron
    /// expression. 5-field expressions fire at second zero.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(CaptureError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("expected 5, 6 or 7 fields, got {n}"),
                })
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| CaptureError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Every tick with `start <= t <= end`, ascending and without duplicates.
    ///
    /// The schedule runs on the local wall clock. A tick that falls in a
    /// daylight-saving gap fires at the first valid instant after it, so a
    /// midnight cron still yields one tick on the day clocks jump forward.
    pub fn range(&self, start: &DateTime<Tz>, end: &DateTime<Tz>) -> Vec<DateTime<Tz>> {
        if start > end {
            return Vec::new();
        }
        let last = end.naive_local();
        // Start early enough to catch a gap tick that resolves onto `start`.
        let mut ticks: Vec<DateTime<Tz>> = self
            .wall_clock_after(start.naive_local() - Duration::minutes(MAX_GAP_MINUTES + 1))
            .take_while(|naive| *naive <= last)
            .filter_map(resolve_local)
            .filter(|t| t >= start && t <= end)
            .collect();
        ticks.dedup();
        ticks
    }

    /// First tick strictly after `ts`.
    pub fn next_after(&self, ts: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.wall_clock_after(ts.naive_local() - Duration::minutes(MAX_GAP_MINUTES))
            .filter_map(resolve_local)
            .find(|t| t > ts)
    }

    /// Wall-clock ticks strictly after `from`. `Utc` only stands in for a
    /// zone without offset changes.
    fn wall_clock_after(&self, from: NaiveDateTime) -> impl Iterator<Item = NaiveDateTime> + '_ {
        self.schedule
            .after(&Utc.from_utc_datetime(&from))
            .map(|t| t.naive_utc())
    }

    /// Smallest gap between consecutive ticks among the first `samples`
    /// ticks after `from`. `None` when fewer than two ticks exist.
    pub fn shortest_gap(&self, from: &DateTime<Tz>, samples: usize) -> Option<Duration> {
        let ticks: Vec<DateTime<Tz>> = self.schedule.after(from).take(samples).collect();
        ticks.windows(2).map(|w| w[1] - w[0]).min()
    }
}

/// Pin a wall-clock tick to the platform timezone, moving it forward out of
/// a daylight-saving gap.
fn resolve_local(naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    (0..=MAX_GAP_MINUTES).find_map(|m| smtr_core::time::localize(naive + Duration::minutes(m)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use smtr_core::{format_timestamp, parse_timestamp};

    fn ts(value: &str) -> DateTime<Tz> {
        parse_timestamp(value).unwrap()
    }

    #[test]
    fn daily_range_is_inclusive_on_both_ends() {
        let cadence = Cadence::parse(DAILY_CRON).unwrap();
        let ticks = cadence.range(&ts("2024-03-10 00:00:00"), &ts("2024-03-12 00:00:00"));
        let rendered: Vec<String> = ticks.iter().map(format_timestamp).collect();
        assert_eq!(
            rendered,
            vec!["2024-03-10 00:00:00", "2024-03-11 00:00:00", "2024-03-12 00:00:00"]
        );
    }

    #[test]
    fn hourly_range_counts_every_hour() {
        let cadence = Cadence::parse(HOURLY_CRON).unwrap();
        let ticks = cadence.range(&ts("2024-03-10 00:00:00"), &ts("2024-03-10 23:59:59"));
        assert_eq!(ticks.len(), 24);
        assert!(ticks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn reversed_bounds_yield_nothing() {
        let cadence = Cadence::parse(DAILY_CRON).unwrap();
        assert!(cadence
            .range(&ts("2024-03-12 00:00:00"), &ts("2024-03-10 00:00:00"))
            .is_empty());
    }

    #[test]
    fn six_field_expressions_are_accepted() {
        let cadence = Cadence::parse("30 */10 * * * *").unwrap();
        let next = cadence.next_after(&ts("2024-03-10 00:00:00")).unwrap();
        assert_eq!(format_timestamp(&next), "2024-03-10 00:00:30");
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = Cadence::parse("0 0 *").unwrap_err();
        assert!(matches!(err, CaptureError::InvalidCron { .. }));
    }

    #[test]
    fn shortest_gap_of_hourly_cron_is_one_hour() {
        let cadence = Cadence::parse(HOURLY_CRON).unwrap();
        let gap = cadence.shortest_gap(&ts("2024-03-10 00:00:00"), 10).unwrap();
        assert_eq!(gap, Duration::hours(1));
    }

    #[test]
    fn daily_range_survives_clocks_jumping_forward() {
        // Local midnight did not exist on 2018-11-04.
        let cadence = Cadence::parse(DAILY_CRON).unwrap();
        let ticks = cadence.range(&ts("2018-11-02 00:00:00"), &ts("2018-11-06 00:00:00"));
        let rendered: Vec<String> = ticks.iter().map(format_timestamp).collect();
        assert_eq!(
            rendered,
            vec![
                "2018-11-02 00:00:00",
                "2018-11-03 00:00:00",
                "2018-11-04 01:00:00",
                "2018-11-05 00:00:00",
                "2018-11-06 00:00:00",
            ]
        );
        let jumped = cadence.range(&ts("2018-11-04 01:00:00"), &ts("2018-11-04 12:00:00"));
        assert_eq!(jumped.len(), 1);
        assert_eq!(
            cadence.next_after(&ts("2018-11-03 12:00:00")).map(|t| format_timestamp(&t)),
            Some("2018-11-04 01:00:00".to_string())
        );
    }
}
