use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::CaptureContext;
use crate::error::{CaptureError, Result};
use crate::extract::{Extractor, Record};
use crate::recapture::{RecapturePlanner, RecaptureWindow};
use crate::source::SourceDescriptor;
use crate::stage;
use crate::storage::{BlobStore, IfExists, UploadOutcome};

/// How a run picks its timestamps.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub recapture: bool,
    /// Lookback of the planner when no explicit timestamps are given.
    pub recapture_days: i64,
    /// Explicit timestamps to recapture, bypassing the planner.
    pub recapture_timestamps: Option<Vec<String>>,
    pub cap_override: Option<usize>,
}

/// Timestamps this run should capture.
///
/// A normal run captures the scheduled instant only. A recapture run uses
/// the explicit list when given, else asks the planner for gaps in the
/// lookback window ending at the scheduled instant.
pub fn resolve_capture_timestamps(
    source: &SourceDescriptor,
    store: &dyn BlobStore,
    scheduled: DateTime<Tz>,
    request: &CaptureRequest,
) -> Result<Vec<DateTime<Tz>>> {
    if !request.recapture {
        return Ok(vec![scheduled]);
    }
    if let Some(explicit) = &request.recapture_timestamps {
        return explicit
            .iter()
            .map(|t| smtr_core::parse_timestamp(t).map_err(Into::into))
            .collect();
    }
    let window = RecaptureWindow::lookback(source, scheduled, request.recapture_days)?;
    RecapturePlanner::new(store).missing_timestamps(source, &window, request.cap_override)
}

#[derive(Debug, Clone, Serialize)]
pub struct CapturedFiles {
    pub records: usize,
    pub raw_keys: Vec<String>,
    pub source_key: String,
    /// Uploads left alone because the object already existed.
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimestampOutcome {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<CapturedFiles>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TimestampOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-timestamp results of one run, in the order timestamps were given.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub run_id: String,
    pub table_id: String,
    pub outcomes: Vec<TimestampOutcome>,
}

impl CaptureReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_ok()).count()
    }
}

/// Fans a capture out over independent timestamps.
pub struct CaptureRunner {
    store: Arc<dyn BlobStore>,
    data_folder: PathBuf,
    max_parallel: usize,
    if_exists: IfExists,
}

impl CaptureRunner {
    pub fn new(store: Arc<dyn BlobStore>, data_folder: impl Into<PathBuf>, max_parallel: usize) -> Self {
        Self {
            store,
            data_folder: data_folder.into(),
            max_parallel: max_parallel.max(1),
            if_exists: IfExists::Replace,
        }
    }

    pub fn with_if_exists(mut self, if_exists: IfExists) -> Self {
        self.if_exists = if_exists;
        self
    }

    /// Capture every timestamp, at most `max_parallel` at a time.
    ///
    /// A failing timestamp is recorded in the report and never stops the
    /// others.
    pub async fn run(
        &self,
        source: Arc<SourceDescriptor>,
        extractor: Arc<dyn Extractor>,
        timestamps: Vec<DateTime<Tz>>,
        extra_parameters: Option<serde_json::Value>,
    ) -> CaptureReport {
        let run_id = Uuid::now_v7().to_string();
        info!(
            %run_id,
            table = %source.table_id(),
            extractor = extractor.name(),
            count = timestamps.len(),
            "capture run started"
        );

        let mut results: Vec<(usize, DateTime<Tz>, Result<CapturedFiles>)> =
            stream::iter(timestamps.into_iter().enumerate())
                .map(|(index, ts)| {
                    let source = Arc::clone(&source);
                    let extractor = Arc::clone(&extractor);
                    let extra = extra_parameters.clone();
                    async move {
                        let result = self.capture_one(source, extractor.as_ref(), ts, extra).await;
                        (index, ts, result)
                    }
                })
                .buffer_unordered(self.max_parallel)
                .collect()
                .await;
        results.sort_by_key(|(index, _, _)| *index);

        let outcomes: Vec<TimestampOutcome> = results
            .into_iter()
            .map(|(_, ts, result)| {
                let timestamp = smtr_core::format_timestamp(&ts);
                match result {
                    Ok(files) => TimestampOutcome {
                        timestamp,
                        files: Some(files),
                        error: None,
                    },
                    Err(e) => {
                        error!(%run_id, %timestamp, "capture failed: {e}");
                        TimestampOutcome {
                            timestamp,
                            files: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .collect();

        let report = CaptureReport {
            run_id,
            table_id: source.table_id().to_string(),
            outcomes,
        };
        info!(
            run_id = %report.run_id,
            table = %report.table_id,
            ok = report.outcomes.len() - report.failed(),
            failed = report.failed(),
            "capture run finished"
        );
        report
    }

    /// Extract, stage and upload a single timestamp.
    async fn capture_one(
        &self,
        source: Arc<SourceDescriptor>,
        extractor: &dyn Extractor,
        ts: DateTime<Tz>,
        extra_parameters: Option<serde_json::Value>,
    ) -> Result<CapturedFiles> {
        let mut ctx = CaptureContext::new(source, &ts, &self.data_folder);
        if let Some(params) = extra_parameters {
            ctx = ctx.with_extra_parameters(params);
        }

        let records = extractor.extract(&ctx).await?;

        // Staging and uploads are blocking file I/O; keep them off the executor.
        let store = Arc::clone(&self.store);
        let if_exists = self.if_exists;
        tokio::task::spawn_blocking(move || stage_and_upload(&*store, ctx, &records, if_exists))
            .await
            .map_err(|e| CaptureError::Storage(format!("staging task failed: {e}")))?
    }
}

fn stage_and_upload(
    store: &dyn BlobStore,
    mut ctx: CaptureContext,
    records: &[Record],
    if_exists: IfExists,
) -> Result<CapturedFiles> {
    let raw_paths = stage::save_raw_pages(&mut ctx, records)?;
    let source_path = stage::write_source_file(&ctx, records)?;

    let mut skipped = 0;
    let mut raw_keys = Vec::with_capacity(raw_paths.len());
    for path in &raw_paths {
        let key = ctx.storage_key_for(path)?;
        let outcome = store.upload(path, &key, if_exists)?;
        skipped += usize::from(outcome == UploadOutcome::Skipped);
        raw_keys.push(key);
    }

    // A recapture with fewer pages must not leave older pages behind.
    for key in store.list(&ctx.raw_key_prefix()?)? {
        if !raw_keys.contains(&key) {
            store.delete(&key)?;
        }
    }

    // Source file last: its presence is what marks the capture finished.
    let source_key = ctx.storage_key_for(&source_path)?;
    let outcome = store.upload(&source_path, &source_key, if_exists)?;
    skipped += usize::from(outcome == UploadOutcome::Skipped);

    Ok(CapturedFiles {
        records: records.len(),
        raw_keys,
        source_key,
        skipped,
    })
}
