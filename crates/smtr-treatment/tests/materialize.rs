// Full materialization runs against a scripted dbt stand-in.
#![cfg(unix)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;
use smtr_capture::partition::{capture_filename, object_key, Partition, StorageMode};
use smtr_capture::{BlobStore, LocalBlobStore, SourceDescriptor};
use smtr_core::config::{DbtTestConfig, SelectorConfig};
use smtr_core::{parse_timestamp, RunEnv};
use smtr_treatment::{
    build_selectors, DbtRunner, MaterializeRequest, Materializer, StateStore, TreatmentError,
};

fn ts(value: &str) -> DateTime<Tz> {
    parse_timestamp(value).unwrap()
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    store: Arc<LocalBlobStore>,
    sources: HashMap<String, Arc<SourceDescriptor>>,
    log: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let store = Arc::new(LocalBlobStore::create(root.join("buckets"), "rj-smtr-dev").unwrap());
        let source = SourceDescriptor::builder("jae", "transacao", ts("2025-04-01"))
            .build()
            .unwrap();
        let sources = HashMap::from([("transacao".to_string(), Arc::new(source))]);
        let log = root.join("dbt.log");
        Self {
            _tmp: tmp,
            root,
            store,
            sources,
            log,
        }
    }

    /// A stand-in for dbt that logs its arguments and runs `tail`.
    fn dbt(&self, tail: &str) -> DbtRunner {
        let script = self.root.join("fake_dbt.sh");
        fs::write(
            &script,
            format!("printf '%s\\n' \"$*\" >> {}\n{tail}\n", self.log.display()),
        )
        .unwrap();
        DbtRunner::new(&format!("sh {}", script.display()), &self.root)
            .with_timeout(Duration::from_millis(500))
    }

    fn capture(&self, hours: &[&str]) {
        let source = &self.sources["transacao"];
        for hour in hours {
            let at = ts(hour);
            let key = object_key(
                StorageMode::Source,
                source.dataset_id(),
                source.table_id(),
                &Partition::for_timestamp(&at, false),
                &capture_filename(&at),
                "csv",
            );
            put(self.store.root(), &key);
        }
    }

    fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|body| body.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn put(root: &Path, key: &str) {
    let path = root.join(key);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "id,content,timestamp_captura\n").unwrap();
}

fn resolver(
    store: Arc<dyn BlobStore>,
) -> impl Fn(&SourceDescriptor) -> smtr_capture::Result<Arc<dyn BlobStore>> {
    move |_| Ok(Arc::clone(&store))
}

fn selector_configs() -> Vec<SelectorConfig> {
    vec![
        SelectorConfig {
            name: "transacao".into(),
            initial_datetime: "2025-04-01 00:00:00".into(),
            flow_folder_name: Some("treatment__transacao".into()),
            incremental_delay_hours: 0,
            data_sources: vec!["source:jae.transacao".into()],
            post_test: Some(DbtTestConfig {
                test_select: "transacao transacao_valor".into(),
                truncate_date: true,
                test_scheduled_time: Some("03:00".into()),
            }),
        },
        SelectorConfig {
            name: "integracao".into(),
            initial_datetime: "2025-04-01 00:00:00".into(),
            flow_folder_name: None,
            incremental_delay_hours: 0,
            data_sources: vec!["selector:transacao".into()],
            post_test: None,
        },
    ]
}

#[tokio::test]
async fn scheduled_runs_advance_state_and_run_due_tests() {
    let fx = Fixture::new();
    fx.capture(&[
        "2025-04-01 00:00",
        "2025-04-01 01:00",
        "2025-04-01 02:00",
        "2025-04-01 03:00",
    ]);
    let selectors = build_selectors(&selector_configs(), &fx.sources).unwrap();
    let state = StateStore::in_memory().unwrap();
    let runner = fx.dbt("exit 0");
    let resolver = resolver(fx.store.clone());
    let materializer = Materializer::new(&runner, &state, &fx.sources, &resolver, RunEnv::Dev);

    let report = materializer
        .materialize(
            &selectors["transacao"],
            &MaterializeRequest::default(),
            ts("2025-04-01 03:00"),
        )
        .await
        .unwrap();

    assert_eq!(report.date_range_start, "2025-04-01 00:00:00");
    assert_eq!(report.date_range_end, "2025-04-01 03:00:00");
    assert!(report.state_updated);
    assert!(report.run.as_ref().unwrap().success());
    assert!(report.test.as_ref().unwrap().success());
    assert_eq!(
        state.last_materialized(RunEnv::Dev, "transacao").unwrap(),
        Some(ts("2025-04-01 03:00"))
    );

    let calls = fx.invocations();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("run --selector transacao --target dev --vars "));
    assert!(calls[0].contains("\"date_range_end\":\"2025-04-01 03:00:00\""));
    assert!(calls[1].starts_with("test --select transacao transacao_valor --target dev"));
    assert!(calls[1].contains("\"date_range_end\":\"2025-04-01 23:59:59\""));

    // The downstream selector now sees its input up to date.
    let downstream = materializer
        .materialize(
            &selectors["integracao"],
            &MaterializeRequest::default(),
            ts("2025-04-01 03:00"),
        )
        .await
        .unwrap();
    assert!(downstream.state_updated);
}

#[tokio::test]
async fn missing_captures_block_the_run() {
    let fx = Fixture::new();
    fx.capture(&["2025-04-01 00:00", "2025-04-01 01:00", "2025-04-01 03:00"]);
    let selectors = build_selectors(&selector_configs(), &fx.sources).unwrap();
    let state = StateStore::in_memory().unwrap();
    let runner = fx.dbt("exit 0");
    let resolver = resolver(fx.store.clone());
    let materializer = Materializer::new(&runner, &state, &fx.sources, &resolver, RunEnv::Dev);

    let err = materializer
        .materialize(
            &selectors["transacao"],
            &MaterializeRequest::default(),
            ts("2025-04-01 03:00"),
        )
        .await
        .unwrap_err();
    match err {
        TreatmentError::IncompleteInputs { selector, pending } => {
            assert_eq!(selector, "transacao");
            assert_eq!(
                pending,
                vec!["jae.transacao: 1 captures missing (newest 2025-04-01 02:00:00)"]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fx.invocations().is_empty());

    let forced = MaterializeRequest {
        skip_source_check: true,
        ..Default::default()
    };
    let report = materializer
        .materialize(&selectors["transacao"], &forced, ts("2025-04-01 04:00"))
        .await
        .unwrap();
    assert!(report.test.is_none());
    assert_eq!(fx.invocations().len(), 1);
}

#[tokio::test]
async fn upstream_selector_must_be_materialized_first() {
    let fx = Fixture::new();
    let selectors = build_selectors(&selector_configs(), &fx.sources).unwrap();
    let state = StateStore::in_memory().unwrap();
    let runner = fx.dbt("exit 0");
    let resolver = resolver(fx.store.clone());
    let materializer = Materializer::new(&runner, &state, &fx.sources, &resolver, RunEnv::Prod);

    let err = materializer
        .materialize(
            &selectors["integracao"],
            &MaterializeRequest::default(),
            ts("2025-04-01 03:00"),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("selector transacao never materialized"));
}

#[tokio::test]
async fn failed_or_slow_dbt_leaves_state_untouched() {
    let fx = Fixture::new();
    let selectors = build_selectors(&selector_configs(), &fx.sources).unwrap();
    let state = StateStore::in_memory().unwrap();
    let resolver = resolver(fx.store.clone());
    let request = MaterializeRequest {
        skip_source_check: true,
        ..Default::default()
    };

    let failing = fx.dbt("exit 2");
    let err = Materializer::new(&failing, &state, &fx.sources, &resolver, RunEnv::Dev)
        .materialize(&selectors["transacao"], &request, ts("2025-04-01 05:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, TreatmentError::DbtFailed { exit_code: 2, .. }));

    let slow = fx.dbt("sleep 5");
    let err = Materializer::new(&slow, &state, &fx.sources, &resolver, RunEnv::Dev)
        .materialize(&selectors["transacao"], &request, ts("2025-04-01 05:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, TreatmentError::Timeout { .. }));

    assert!(state.last_materialized(RunEnv::Dev, "transacao").unwrap().is_none());
}

#[tokio::test]
async fn explicit_window_and_dry_run() {
    let fx = Fixture::new();
    let selectors = build_selectors(&selector_configs(), &fx.sources).unwrap();
    let state = StateStore::in_memory().unwrap();
    let runner = fx.dbt("exit 0");
    let resolver = resolver(fx.store.clone());
    let materializer = Materializer::new(&runner, &state, &fx.sources, &resolver, RunEnv::Dev);

    let dry = MaterializeRequest {
        start: Some(ts("2025-04-01 00:00")),
        end: Some(ts("2025-04-01 02:00")),
        skip_source_check: true,
        dry_run: true,
        flags: vec!["--full-refresh".into()],
        ..Default::default()
    };
    let report = materializer
        .materialize(&selectors["transacao"], &dry, ts("2025-04-01 10:00"))
        .await
        .unwrap();
    assert!(report.run.is_none());
    assert_eq!(report.run_args.last().map(String::as_str), Some("--full-refresh"));
    assert!(fx.invocations().is_empty());

    let backfill = MaterializeRequest {
        dry_run: false,
        ..dry
    };
    let report = materializer
        .materialize(&selectors["transacao"], &backfill, ts("2025-04-01 10:00"))
        .await
        .unwrap();
    assert!(report.run.is_some());
    assert!(!report.state_updated);
    assert!(state.last_materialized(RunEnv::Dev, "transacao").unwrap().is_none());
}
