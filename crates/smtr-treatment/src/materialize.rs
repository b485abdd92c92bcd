use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{Map, Value};
use smtr_capture::SourceDescriptor;
use smtr_core::RunEnv;
use tracing::{info, warn};

use crate::dbt::{DbtCommand, DbtOutput, DbtRunner};
use crate::error::{Result, TreatmentError};
use crate::selector::DbtSelector;
use crate::state::StateStore;
use crate::window::{find_input_gaps, MaterializationWindow, StoreResolver};

/// Parameters of one materialization run.
#[derive(Debug, Clone, Default)]
pub struct MaterializeRequest {
    pub start: Option<DateTime<Tz>>,
    pub end: Option<DateTime<Tz>>,
    pub skip_source_check: bool,
    pub force_test: bool,
    pub additional_vars: Map<String, Value>,
    pub flags: Vec<String>,
    /// Resolve and check, but do not run dbt or touch state.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializationReport {
    pub selector: String,
    pub env: RunEnv,
    pub date_range_start: String,
    pub date_range_end: String,
    pub run_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<DbtOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<DbtOutput>,
    pub state_updated: bool,
}

/// Sequences one materialization: window, input check, `dbt run`, state
/// update, then the post-run tests when due.
pub struct Materializer<'a> {
    runner: &'a DbtRunner,
    state: &'a StateStore,
    sources: &'a HashMap<String, Arc<SourceDescriptor>>,
    store_for: &'a StoreResolver<'a>,
    env: RunEnv,
}

impl<'a> Materializer<'a> {
    pub fn new(
        runner: &'a DbtRunner,
        state: &'a StateStore,
        sources: &'a HashMap<String, Arc<SourceDescriptor>>,
        store_for: &'a StoreResolver<'a>,
        env: RunEnv,
    ) -> Self {
        Self {
            runner,
            state,
            sources,
            store_for,
            env,
        }
    }

    /// `now` is the run's scheduled instant.
    ///
    /// State only advances after a successful run whose end was not given
    /// explicitly, so manual backfills never move the incremental pointer.
    pub async fn materialize(
        &self,
        selector: &DbtSelector,
        request: &MaterializeRequest,
        now: DateTime<Tz>,
    ) -> Result<MaterializationReport> {
        let last_run = self.state.last_materialized(self.env, selector.name())?;
        let window =
            MaterializationWindow::resolve(selector, request.start, request.end, last_run, now)?;

        if request.skip_source_check {
            warn!(selector = selector.name(), "source check skipped");
        } else {
            let gaps = find_input_gaps(
                selector,
                &window,
                self.sources,
                self.store_for,
                self.state,
                self.env,
            )?;
            if !gaps.is_empty() {
                return Err(TreatmentError::IncompleteInputs {
                    selector: selector.name().to_string(),
                    pending: gaps.describe(),
                });
            }
        }

        let command = DbtCommand::run(selector.name(), self.env)
            .window(&window)
            .vars(&request.additional_vars)
            .flags(request.flags.iter().cloned());
        let (date_range_start, date_range_end) = window.as_vars();
        let mut report = MaterializationReport {
            selector: selector.name().to_string(),
            env: self.env,
            date_range_start,
            date_range_end,
            run_args: command.args()?,
            run: None,
            test: None,
            state_updated: false,
        };

        if request.dry_run {
            info!(selector = selector.name(), "dry run, dbt not invoked");
            return Ok(report);
        }

        info!(
            selector = selector.name(),
            env = %self.env,
            start = %report.date_range_start,
            end = %report.date_range_end,
            "materialization started"
        );
        let run = self.runner.execute(&command).await?.ensure_success()?;
        report.run = Some(run);

        if request.end.is_none() {
            self.state
                .record_success(self.env, selector.name(), &window.end)?;
            report.state_updated = true;
        }

        if let Some(test) = selector.post_test() {
            if test.is_due(&now, request.force_test) {
                let test_window = if test.truncate_date {
                    window.truncated_to_dates()
                } else {
                    window
                };
                let command = DbtCommand::test(&test.test_select, self.env).window(&test_window);
                let output = self.runner.execute(&command).await?;
                if !output.success() {
                    warn!(
                        selector = selector.name(),
                        exit_code = output.exit_code,
                        "post-run tests failed"
                    );
                }
                report.test = Some(output);
            }
        }

        Ok(report)
    }
}
