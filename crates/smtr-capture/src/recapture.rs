//! Recapture planning.
//!
//! A capture is finished once its normalized source file exists in storage.
//! The planner compares the cadence's expected instants with the finished
//! captures found there and proposes the missing ones, newest first.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDateTime};
use chrono_tz::Tz;
use tracing::{debug, info};

use crate::error::{CaptureError, Result};
use crate::partition::marker_prefix;
use crate::source::SourceDescriptor;
use crate::storage::BlobStore;

/// Length of a finished-capture filename: `YYYY-MM-DD-HH-MM-SS.csv`.
pub const MARKER_FILENAME_LEN: usize = 23;
pub const MARKER_FORMAT: &str = "%Y-%m-%d-%H-%M-%S.csv";

/// Cap used by historical backfills regardless of the source's own limit.
pub const HISTORICAL_RECAPTURE_CAP: usize = 24;

/// Inclusive bounds of the expected-timestamp sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecaptureWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl RecaptureWindow {
    pub fn fixed(start: DateTime<Tz>, end: DateTime<Tz>) -> Self {
        Self { start, end }
    }

    /// The last `days` days up to `now`, never earlier than the source's
    /// first valid timestamp.
    ///
    /// Negative lookbacks and ones reaching past the representable range
    /// are rejected.
    pub fn lookback(source: &SourceDescriptor, now: DateTime<Tz>, days: i64) -> Result<Self> {
        let start = Duration::try_days(days)
            .filter(|_| days >= 0)
            .and_then(|span| now.checked_sub_signed(span))
            .ok_or(CaptureError::InvalidLookback { days })?;
        Ok(Self {
            start: start.max(*source.first_timestamp()),
            end: now,
        })
    }
}

/// Parse the capture instant out of a storage key.
///
/// Only the last path segment counts; it must be exactly
/// `YYYY-MM-DD-HH-MM-SS.csv`. Anything else is not a marker.
pub fn parse_marker(key: &str) -> Option<DateTime<Tz>> {
    let filename = key.rsplit('/').next()?;
    if filename.len() != MARKER_FILENAME_LEN || !filename.contains(".csv") {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(filename, MARKER_FORMAT).ok()?;
    smtr_core::time::localize(naive)
}

pub struct RecapturePlanner<'a> {
    store: &'a dyn BlobStore,
}

impl<'a> RecapturePlanner<'a> {
    pub fn new(store: &'a dyn BlobStore) -> Self {
        Self { store }
    }

    /// Expected instants in `window` with no finished capture, newest
    /// first, at most `cap_override` (or the source's `max_recaptures`).
    ///
    /// Listing errors propagate; malformed keys are skipped.
    pub fn missing_timestamps(
        &self,
        source: &SourceDescriptor,
        window: &RecaptureWindow,
        cap_override: Option<usize>,
    ) -> Result<Vec<DateTime<Tz>>> {
        let expected = source.cadence().range(&window.start, &window.end);

        let prefix = marker_prefix(source.dataset_id(), source.table_id());
        let existing: HashSet<DateTime<Tz>> = self
            .store
            .list(&prefix)?
            .iter()
            .filter_map(|key| parse_marker(key))
            .collect();

        let mut missing: Vec<DateTime<Tz>> = expected
            .iter()
            .filter(|ts| !existing.contains(*ts))
            .copied()
            .collect();
        missing.sort_unstable_by(|a, b| b.cmp(a));
        missing.dedup();

        let cap = cap_override.unwrap_or(source.max_recaptures());
        let total_missing = missing.len();
        missing.truncate(cap);

        debug!(
            table = %source.table_id(),
            expected = expected.len(),
            existing = existing.len(),
            missing = total_missing,
            cap,
            "recapture gaps computed"
        );
        if !missing.is_empty() {
            info!(
                table = %source.table_id(),
                planned = missing.len(),
                "recaptures planned"
            );
        }
        Ok(missing)
    }

    /// Same as [`missing_timestamps`](Self::missing_timestamps), rendered as
    /// `YYYY-MM-DD HH:MM:SS` for the orchestrator.
    pub fn plan(
        &self,
        source: &SourceDescriptor,
        window: &RecaptureWindow,
        cap_override: Option<usize>,
    ) -> Result<Vec<String>> {
        Ok(self
            .missing_timestamps(source, window, cap_override)?
            .iter()
            .map(smtr_core::format_timestamp)
            .collect())
    }
}
