//! Materialization windows and the input completeness check.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use serde::Serialize;
use smtr_capture::{BlobStore, RecapturePlanner, RecaptureWindow, SourceDescriptor};
use smtr_core::RunEnv;
use tracing::{debug, warn};

use crate::error::{Result, TreatmentError};
use crate::selector::DbtSelector;
use crate::state::StateStore;

/// Inclusive interval of data one materialization run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializationWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl MaterializationWindow {
    /// Start is the explicit value, else the last successful end, else the
    /// selector's initial datetime. End is the explicit value, else `now`
    /// minus the selector's incremental delay.
    pub fn resolve(
        selector: &DbtSelector,
        start: Option<DateTime<Tz>>,
        end: Option<DateTime<Tz>>,
        last_run: Option<DateTime<Tz>>,
        now: DateTime<Tz>,
    ) -> Result<Self> {
        let start = start
            .or(last_run)
            .unwrap_or(*selector.initial_datetime());
        let end = end.unwrap_or(now - Duration::hours(selector.incremental_delay_hours()));
        if start > end {
            return Err(TreatmentError::InvalidWindow {
                start: smtr_core::format_timestamp(&start),
                end: smtr_core::format_timestamp(&end),
            });
        }
        debug!(
            selector = selector.name(),
            start = %smtr_core::format_timestamp(&start),
            end = %smtr_core::format_timestamp(&end),
            "materialization window resolved"
        );
        Ok(Self { start, end })
    }

    /// Widen the window to whole days: first day's midnight to last day's
    /// `23:59:59`.
    pub fn truncated_to_dates(&self) -> Self {
        let at = |ts: &DateTime<Tz>, h: u32, m: u32, s: u32| {
            ts.date_naive()
                .and_hms_opt(h, m, s)
                .and_then(smtr_core::time::localize)
                .unwrap_or(*ts)
        };
        Self {
            start: at(&self.start, 0, 0, 0),
            end: at(&self.end, 23, 59, 59),
        }
    }

    /// `(date_range_start, date_range_end)` as passed to dbt.
    pub fn as_vars(&self) -> (String, String) {
        (
            smtr_core::format_timestamp(&self.start),
            smtr_core::format_timestamp(&self.end),
        )
    }
}

/// Inputs that do not cover a window yet.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InputGaps {
    /// Missing capture instants per `source.table`, newest first.
    pub sources: Vec<(String, Vec<String>)>,
    /// Upstream selectors whose last materialization is before the window end.
    pub selectors: Vec<(String, Option<String>)>,
}

impl InputGaps {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.selectors.is_empty()
    }

    /// One line per pending input, for error messages.
    pub fn describe(&self) -> Vec<String> {
        let sources = self.sources.iter().map(|(name, missing)| {
            let newest = missing.first().map(String::as_str).unwrap_or("-");
            format!("{name}: {} captures missing (newest {newest})", missing.len())
        });
        let selectors = self.selectors.iter().map(|(name, last)| match last {
            Some(last) => format!("selector {name} materialized only until {last}"),
            None => format!("selector {name} never materialized"),
        });
        sources.chain(selectors).collect()
    }
}

/// Resolves the bucket holding a source's captures.
pub type StoreResolver<'a> =
    dyn Fn(&SourceDescriptor) -> smtr_capture::Result<Arc<dyn BlobStore>> + 'a;

/// Compare the window against every input of `selector`.
///
/// A captured source is complete when each cadence instant inside the
/// window has a finished capture. An upstream selector is complete when its
/// last materialization reaches the window end.
pub fn find_input_gaps(
    selector: &DbtSelector,
    window: &MaterializationWindow,
    sources: &HashMap<String, Arc<SourceDescriptor>>,
    store_for: &StoreResolver<'_>,
    state: &StateStore,
    env: RunEnv,
) -> Result<InputGaps> {
    let mut gaps = InputGaps::default();

    for qualified in selector.source_dependencies() {
        let Some(source) = sources
            .values()
            .map(Arc::as_ref)
            .find(|s| s.qualified_name() == qualified)
        else {
            return Err(TreatmentError::InvalidSelector {
                name: selector.name().to_string(),
                reason: format!("unknown data source source:{qualified}"),
            });
        };
        let start = window.start.max(*source.first_timestamp());
        if start > window.end {
            continue;
        }
        let store = store_for(source)?;
        let missing = RecapturePlanner::new(store.as_ref()).plan(
            source,
            &RecaptureWindow::fixed(start, window.end),
            Some(usize::MAX),
        )?;
        if !missing.is_empty() {
            warn!(
                selector = selector.name(),
                source = qualified,
                missing = missing.len(),
                "source captures missing for window"
            );
            gaps.sources.push((qualified.to_string(), missing));
        }
    }

    for upstream in selector.selector_dependencies() {
        let last = state.last_materialized(env, upstream)?;
        if last.map_or(true, |ts| ts < window.end) {
            warn!(selector = selector.name(), upstream, "upstream selector behind window");
            gaps.selectors
                .push((upstream.to_string(), last.map(|ts| smtr_core::format_timestamp(&ts))));
        }
    }

    Ok(gaps)
}
