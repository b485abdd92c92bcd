use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use tracing::debug;

use crate::error::{CaptureError, Result};
use crate::partition::{
    capture_filename, object_key, Partition, StorageMode, SOURCE_FILETYPE,
};
use crate::source::SourceDescriptor;

/// Placeholder in the raw path template replaced by the page index.
pub const PAGE_PLACEHOLDER: &str = "{page}";

/// One capture attempt of one source at one instant.
///
/// Every path is a pure function of the source and the timestamp, so
/// re-running the same timestamp overwrites the same files.
#[derive(Debug, Clone)]
pub struct CaptureContext {
    source: Arc<SourceDescriptor>,
    timestamp: DateTime<Tz>,
    data_folder: PathBuf,
    partition: Partition,
    raw_filepath: PathBuf,
    source_filepath: PathBuf,
    extra_parameters: Option<serde_json::Value>,
    captured_raw_filepaths: Vec<PathBuf>,
}

impl CaptureContext {
    pub fn new<Z: TimeZone>(
        source: Arc<SourceDescriptor>,
        timestamp: &DateTime<Z>,
        data_folder: impl Into<PathBuf>,
    ) -> Self {
        let timestamp = smtr_core::time::to_platform(timestamp);
        let data_folder = data_folder.into();
        let partition = Partition::for_timestamp(&timestamp, source.partition_date_only());
        let filename = capture_filename(&timestamp);

        let raw_filepath = data_folder.join(object_key(
            StorageMode::Raw,
            source.dataset_id(),
            source.table_id(),
            &partition,
            &format!("{filename}_{PAGE_PLACEHOLDER}"),
            source.raw_filetype(),
        ));
        let source_filepath = data_folder.join(object_key(
            StorageMode::Source,
            source.dataset_id(),
            source.table_id(),
            &partition,
            &filename,
            SOURCE_FILETYPE,
        ));

        debug!(
            table = %source.table_id(),
            %timestamp,
            %partition,
            "capture context created"
        );

        Self {
            source,
            timestamp,
            data_folder,
            partition,
            raw_filepath,
            source_filepath,
            extra_parameters: None,
            captured_raw_filepaths: Vec::new(),
        }
    }

    /// Build from a wall-clock reading in the platform timezone.
    pub fn from_naive(
        source: Arc<SourceDescriptor>,
        timestamp: NaiveDateTime,
        data_folder: impl Into<PathBuf>,
    ) -> Result<Self> {
        let ts = smtr_core::time::localize(timestamp).ok_or_else(|| {
            CaptureError::Core(smtr_core::CoreError::InvalidTimestamp {
                value: timestamp.to_string(),
            })
        })?;
        Ok(Self::new(source, &ts, data_folder))
    }

    /// Attach free-form parameters handed through to the extractor.
    pub fn with_extra_parameters(mut self, params: serde_json::Value) -> Self {
        self.extra_parameters = Some(params);
        self
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn timestamp(&self) -> &DateTime<Tz> {
        &self.timestamp
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Raw path template; still contains the `{page}` placeholder.
    pub fn raw_filepath(&self) -> &Path {
        &self.raw_filepath
    }

    pub fn source_filepath(&self) -> &Path {
        &self.source_filepath
    }

    pub fn extra_parameters(&self) -> Option<&serde_json::Value> {
        self.extra_parameters.as_ref()
    }

    pub fn raw_filepath_for_page(&self, page: usize) -> PathBuf {
        PathBuf::from(
            self.raw_filepath
                .to_string_lossy()
                .replace(PAGE_PLACEHOLDER, &page.to_string()),
        )
    }

    /// Object key shared by every raw page of this capture, up to the page index.
    pub fn raw_key_prefix(&self) -> Result<String> {
        let key = self.storage_key_for(&self.raw_filepath)?;
        match key.find(PAGE_PLACEHOLDER) {
            Some(end) => Ok(key[..end].to_string()),
            None => Ok(key),
        }
    }

    pub fn record_captured(&mut self, path: PathBuf) {
        self.captured_raw_filepaths.push(path);
    }

    pub fn captured_raw_filepaths(&self) -> &[PathBuf] {
        &self.captured_raw_filepaths
    }

    /// Interval of upstream records belonging to this capture:
    /// the day (date-only sources) or hour ending at the timestamp.
    pub fn capture_window(&self) -> (DateTime<Tz>, DateTime<Tz>) {
        let span = if self.source.partition_date_only() {
            Duration::days(1)
        } else {
            Duration::hours(1)
        };
        (self.timestamp - span, self.timestamp)
    }

    /// Object key of a file staged under this context's data folder.
    pub fn storage_key_for(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.data_folder).map_err(|_| {
            CaptureError::Storage(format!(
                "{} is outside data folder {}",
                path.display(),
                self.data_folder.display()
            ))
        })?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                other => {
                    return Err(CaptureError::Storage(format!(
                        "unexpected path component {other:?} in {}",
                        path.display()
                    )))
                }
            }
        }
        Ok(parts.join("/"))
    }
}

/// Display name of a capture run: `[YYYY-MM-DD HH-MM-SS] <flow> - Recapture: <bool>`.
pub fn capture_run_name<Z: TimeZone>(
    flow_name: &str,
    scheduled_start: &DateTime<Z>,
    recapture: bool,
) -> String {
    let start = smtr_core::time::to_platform(scheduled_start).format("%Y-%m-%d %H-%M-%S");
    let recapture = if recapture { "True" } else { "False" };
    format!("[{start}] {flow_name} - Recapture: {recapture}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use smtr_core::parse_timestamp;

    fn hourly_source() -> Arc<SourceDescriptor> {
        let first = parse_timestamp("2025-03-26 15:30:00").unwrap();
        Arc::new(
            SourceDescriptor::builder("jae", "gps_validador", first)
                .primary_keys(["id"])
                .build()
                .unwrap(),
        )
    }

    fn daily_source() -> Arc<SourceDescriptor> {
        let first = parse_timestamp("2024-01-07 00:00:00").unwrap();
        Arc::new(
            SourceDescriptor::builder("jae", "linha", first)
                .partition_date_only(true)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn timestamp_is_normalized_to_platform_timezone() {
        let utc = Utc.with_ymd_and_hms(2025, 4, 1, 13, 0, 0).unwrap();
        let ctx = CaptureContext::new(hourly_source(), &utc, "/data");
        assert_eq!(ctx.timestamp().to_rfc3339(), "2025-04-01T10:00:00-03:00");
        assert_eq!(ctx.partition().as_str(), "data=2025-04-01/hora=10");
    }

    #[test]
    fn paths_follow_layout() {
        let ts = parse_timestamp("2025-04-01 10:00:00").unwrap();
        let ctx = CaptureContext::new(hourly_source(), &ts, "/data");

        assert_eq!(
            ctx.raw_filepath(),
            Path::new(
                "/data/raw/source_jae/gps_validador/data=2025-04-01/hora=10/2025-04-01-10-00-00_{page}.json"
            )
        );
        assert_eq!(
            ctx.source_filepath(),
            Path::new(
                "/data/source/source_jae/gps_validador/data=2025-04-01/hora=10/2025-04-01-10-00-00.csv"
            )
        );
        assert!(ctx
            .raw_filepath_for_page(3)
            .to_string_lossy()
            .ends_with("2025-04-01-10-00-00_3.json"));
    }

    #[test]
    fn construction_is_idempotent() {
        let ts = parse_timestamp("2025-04-01 10:17:00").unwrap();
        let a = CaptureContext::new(hourly_source(), &ts, "/data");
        let b = CaptureContext::new(hourly_source(), &ts, "/data");
        assert_eq!(a.raw_filepath(), b.raw_filepath());
        assert_eq!(a.source_filepath(), b.source_filepath());
        assert_eq!(a.partition(), b.partition());
    }

    #[test]
    fn naive_timestamps_are_wall_clock() {
        let naive = NaiveDateTime::parse_from_str("2024-03-10 23:30:00", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        let ctx = CaptureContext::from_naive(daily_source(), naive, "/data").unwrap();
        assert_eq!(ctx.partition().as_str(), "data=2024-03-10");
    }

    #[test]
    fn capture_window_matches_granularity() {
        let ts = parse_timestamp("2024-03-10 00:00:00").unwrap();
        let daily = CaptureContext::new(daily_source(), &ts, "/data");
        let (start, end) = daily.capture_window();
        assert_eq!(end - start, Duration::days(1));

        let hourly = CaptureContext::new(hourly_source(), &ts, "/data");
        let (start, end) = hourly.capture_window();
        assert_eq!(end - start, Duration::hours(1));
    }

    #[test]
    fn storage_key_is_relative_to_data_folder() {
        let ts = parse_timestamp("2024-03-10 00:00:00").unwrap();
        let ctx = CaptureContext::new(daily_source(), &ts, "/data");
        let key = ctx.storage_key_for(ctx.source_filepath()).unwrap();
        assert_eq!(key, "source/source_jae/linha/data=2024-03-10/2024-03-10-00-00-00.csv");

        assert!(ctx.storage_key_for(Path::new("/elsewhere/file.csv")).is_err());
    }

    #[test]
    fn raw_key_prefix_stops_at_page_index() {
        let ts = parse_timestamp("2025-04-01 10:00:00").unwrap();
        let ctx = CaptureContext::new(hourly_source(), &ts, "/data");
        let prefix = ctx.raw_key_prefix().unwrap();
        assert_eq!(
            prefix,
            "raw/source_jae/gps_validador/data=2025-04-01/hora=10/2025-04-01-10-00-00_"
        );
        let page = ctx.storage_key_for(&ctx.raw_filepath_for_page(2)).unwrap();
        assert!(page.starts_with(&prefix));
    }

    #[test]
    fn captured_paths_are_tracked() {
        let ts = parse_timestamp("2024-03-10 00:00:00").unwrap();
        let mut ctx = CaptureContext::new(daily_source(), &ts, "/data");
        ctx.record_captured(ctx.raw_filepath_for_page(0));
        assert_eq!(ctx.captured_raw_filepaths().len(), 1);
    }

    #[test]
    fn run_name_format() {
        let scheduled = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        assert_eq!(
            capture_run_name("capture__jae_transacao", &scheduled, false),
            "[2024-03-10 12-00-00] capture__jae_transacao - Recapture: False"
        );
    }
}
