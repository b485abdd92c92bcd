use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Map, Value};
use smtr_capture::context::capture_run_name;
use smtr_capture::recapture::HISTORICAL_RECAPTURE_CAP;
use smtr_capture::runner::resolve_capture_timestamps;
use smtr_capture::{
    CaptureContext, CaptureRequest, CaptureRunner, Extractor, HttpExtractor, RecapturePlanner,
    RecaptureWindow, SourceDescriptor,
};
use smtr_integration::{header_map, post_all, prepare_negativacao_payloads, Row};
use smtr_treatment::{DbtRunner, MaterializeRequest, Materializer, StateStore};
use tracing::info;

use crate::app::App;
use crate::cli::{CaptureArgs, MaterializeArgs, PostArgs};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse an optional JSON object argument.
fn json_object(raw: Option<&str>, what: &str) -> anyhow::Result<Option<Map<String, Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(raw).with_context(|| format!("{what} is not valid JSON"))? {
        Value::Object(map) => Ok(Some(map)),
        other => bail!("{what} must be a JSON object, got {other}"),
    }
}

pub fn env(app: &App) -> anyhow::Result<()> {
    print_json(&json!({ "env": app.env }))
}

pub fn context(app: &App, table_id: &str, timestamp: Option<&str>) -> anyhow::Result<()> {
    let source = app.source(table_id)?;
    let ts = app.scheduled(timestamp)?;
    let ctx = CaptureContext::new(Arc::clone(&source), &ts, app.data_folder());
    let flow = source
        .flow_folder_name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("capture__{}", source.dataset_id()));

    print_json(&json!({
        "source": &*source,
        "bucket": source.bucket_name(app.env, &app.config.storage.bucket_names),
        "timestamp": smtr_core::format_timestamp(ctx.timestamp()),
        "partition": ctx.partition().as_str(),
        "raw_filepath": ctx.raw_filepath(),
        "source_filepath": ctx.source_filepath(),
        "source_key": ctx.storage_key_for(ctx.source_filepath())?,
        "run_name": capture_run_name(&flow, ctx.timestamp(), false),
    }))
}

pub struct PlanOptions<'a> {
    pub start: Option<&'a str>,
    pub end: Option<&'a str>,
    pub days: Option<i64>,
    pub cap: Option<usize>,
    pub historical: bool,
}

pub fn plan(app: &App, table_id: &str, options: PlanOptions<'_>) -> anyhow::Result<()> {
    let source = app.source(table_id)?;
    let end = app.scheduled(options.end)?;
    let window = match options.start {
        Some(start) => {
            let start = smtr_core::parse_timestamp(start)?.max(*source.first_timestamp());
            RecaptureWindow::fixed(start, end)
        }
        None => RecaptureWindow::lookback(
            &source,
            end,
            options.days.unwrap_or(app.config.capture.recapture_days),
        )?,
    };
    let cap = if options.historical {
        Some(HISTORICAL_RECAPTURE_CAP)
    } else {
        options.cap
    };

    let store = app.store_for(&source, false)?;
    let timestamps = RecapturePlanner::new(&*store).plan(&source, &window, cap)?;
    print_json(&json!({
        "table_id": source.table_id(),
        "window": {
            "start": smtr_core::format_timestamp(&window.start),
            "end": smtr_core::format_timestamp(&window.end),
        },
        "timestamps": timestamps,
    }))
}

fn extractor_for(
    source: &SourceDescriptor,
    url: Option<&str>,
) -> anyhow::Result<Arc<dyn Extractor>> {
    let Some(url) = url.or(source.api_url()) else {
        bail!("source {} has no api_url; pass --url", source.table_id());
    };
    Ok(Arc::new(HttpExtractor::new(url)))
}

pub async fn capture(app: &App, args: CaptureArgs) -> anyhow::Result<()> {
    let source = app.source(&args.table_id)?;
    let scheduled = app.scheduled(args.timestamp.as_deref())?;
    let extra = json_object(args.extra_parameters.as_deref(), "--extra-parameters")?;
    let extractor = extractor_for(&source, args.url.as_deref())?;
    let store = app.store_for(&source, true)?;

    let request = CaptureRequest {
        recapture: args.recapture,
        recapture_days: args
            .recapture_days
            .unwrap_or(app.config.capture.recapture_days),
        recapture_timestamps: args.recapture_timestamps,
        cap_override: args.cap,
    };
    // Planning failures stop the run before anything is extracted.
    let timestamps = resolve_capture_timestamps(&source, &*store, scheduled, &request)?;
    info!(
        table = %source.table_id(),
        recapture = request.recapture,
        count = timestamps.len(),
        "capture timestamps resolved"
    );

    let report = CaptureRunner::new(store, app.data_folder(), app.config.capture.max_parallel)
        .with_if_exists(args.if_exists)
        .run(source, extractor, timestamps, extra.map(Value::Object))
        .await;
    print_json(&report)?;

    let failed = report.failed();
    if failed > 0 {
        bail!("{failed} of {} timestamps failed", report.outcomes.len());
    }
    Ok(())
}

pub async fn materialize(app: &App, args: MaterializeArgs) -> anyhow::Result<()> {
    let selector = app.selector(&args.selector)?;
    let now = app.scheduled(args.timestamp.as_deref())?;
    let parse = |value: Option<&str>| value.map(smtr_core::parse_timestamp).transpose();

    let request = MaterializeRequest {
        start: parse(args.start.as_deref())?,
        end: parse(args.end.as_deref())?,
        skip_source_check: args.skip_source_check,
        force_test: args.force_test,
        additional_vars: json_object(args.vars.as_deref(), "--vars")?.unwrap_or_default(),
        flags: args.flags,
        dry_run: args.dry_run,
    };

    let runner = DbtRunner::from_config(&app.config.dbt);
    let state = StateStore::open(&app.config.dbt.state_db)
        .with_context(|| format!("opening state db {}", app.config.dbt.state_db))?;
    let resolver = |source: &SourceDescriptor| app.store_for(source, false);
    let materializer = Materializer::new(&runner, &state, &app.sources, &resolver, app.env);

    let report = materializer.materialize(&selector, &request, now).await?;
    print_json(&report)
}

pub async fn post(app: &App, args: PostArgs) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.rows)
        .with_context(|| format!("reading {}", args.rows.display()))?;
    let rows: Vec<Row> = serde_json::from_str(&raw)
        .with_context(|| format!("{} must hold a JSON array of objects", args.rows.display()))?;

    let execution_date = match args.date.as_deref() {
        Some(date) => NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .with_context(|| format!("--date {date} is not YYYY-MM-DD"))?,
        None => app.scheduled(None)?.date_naive(),
    };
    let payloads = prepare_negativacao_payloads(&rows, execution_date);
    if args.dry_run {
        return print_json(&payloads);
    }

    let pairs = args
        .headers
        .iter()
        .map(|h| {
            h.split_once('=')
                .with_context(|| format!("--header {h} must be NAME=VALUE"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let headers = header_map(pairs)?;

    let client = reqwest::Client::new();
    let outcomes = post_all(
        &client,
        &args.url,
        &payloads,
        &headers,
        args.max_concurrent
            .unwrap_or(app.config.integration.max_concurrent),
        Duration::from_secs(
            args.timeout_secs
                .unwrap_or(app.config.integration.timeout_secs),
        ),
    )
    .await;
    print_json(&outcomes)?;

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if failed > 0 {
        bail!("{failed} of {} requests failed", outcomes.len());
    }
    Ok(())
}
