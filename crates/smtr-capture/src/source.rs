use chrono::{DateTime, Duration, TimeZone};
use chrono_tz::Tz;
use serde::Serialize;
use smtr_core::config::{BucketNames, SourceConfig};
use smtr_core::{parse_timestamp, RunEnv};

use crate::cadence::{Cadence, DAILY_CRON, HOURLY_CRON};
use crate::error::{CaptureError, Result};

pub const DEFAULT_MAX_RECAPTURES: usize = 60;
pub const DEFAULT_RAW_FILETYPE: &str = "json";
pub const RAW_FILETYPES: &[&str] = &["json", "csv", "txt"];

/// Static description of an extractable table.
///
/// Built and validated once, then shared read-only (usually behind an `Arc`)
/// by every run that captures the table.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDescriptor {
    source_name: String,
    table_id: String,
    dataset_id: String,
    first_timestamp: DateTime<Tz>,
    primary_keys: Vec<String>,
    partition_date_only: bool,
    max_recaptures: usize,
    raw_filetype: String,
    #[serde(serialize_with = "serialize_cadence")]
    cadence: Cadence,
    bucket_names: Option<BucketNames>,
    file_chunk_size: Option<usize>,
    api_url: Option<String>,
    flow_folder_name: Option<String>,
}

fn serialize_cadence<S: serde::Serializer>(
    cadence: &Cadence,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(cadence.expression())
}

impl SourceDescriptor {
    pub fn builder<Z: TimeZone>(
        source_name: &str,
        table_id: &str,
        first_timestamp: DateTime<Z>,
    ) -> SourceDescriptorBuilder {
        SourceDescriptorBuilder {
            source_name: source_name.to_string(),
            table_id: table_id.to_string(),
            first_timestamp: smtr_core::time::to_platform(&first_timestamp),
            primary_keys: Vec::new(),
            partition_date_only: false,
            max_recaptures: DEFAULT_MAX_RECAPTURES,
            raw_filetype: DEFAULT_RAW_FILETYPE.to_string(),
            schedule_cron: None,
            bucket_names: None,
            file_chunk_size: None,
            api_url: None,
            flow_folder_name: None,
        }
    }

    /// Validate a config file entry.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let first_timestamp =
            parse_timestamp(&config.first_timestamp).map_err(|e| CaptureError::InvalidSource {
                table_id: config.table_id.clone(),
                reason: format!("first_timestamp: {e}"),
            })?;

        let mut builder = Self::builder(&config.source_name, &config.table_id, first_timestamp)
            .primary_keys(config.primary_keys.clone());
        if let Some(date_only) = config.partition_date_only {
            builder = builder.partition_date_only(date_only);
        }
        if let Some(max) = config.max_recaptures {
            builder = builder.max_recaptures(max);
        }
        if let Some(filetype) = &config.raw_filetype {
            builder = builder.raw_filetype(filetype);
        }
        if let Some(cron) = &config.schedule_cron {
            builder = builder.schedule_cron(cron);
        }
        if let Some(buckets) = &config.bucket_names {
            builder = builder.bucket_names(buckets.clone());
        }
        if let Some(chunk) = config.file_chunk_size {
            builder = builder.file_chunk_size(chunk);
        }
        if let Some(url) = &config.api_url {
            builder = builder.api_url(url);
        }
        if let Some(folder) = &config.flow_folder_name {
            builder = builder.flow_folder_name(folder);
        }
        builder.build()
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn first_timestamp(&self) -> &DateTime<Tz> {
        &self.first_timestamp
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn partition_date_only(&self) -> bool {
        self.partition_date_only
    }

    pub fn max_recaptures(&self) -> usize {
        self.max_recaptures
    }

    pub fn raw_filetype(&self) -> &str {
        &self.raw_filetype
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    pub fn file_chunk_size(&self) -> Option<usize> {
        self.file_chunk_size
    }

    pub fn api_url(&self) -> Option<&str> {
        self.api_url.as_deref()
    }

    pub fn flow_folder_name(&self) -> Option<&str> {
        self.flow_folder_name.as_deref()
    }

    /// `<source_name>.<table_id>`, the reference used by selectors.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.source_name, self.table_id)
    }

    /// Bucket this source writes to: its own override, else the default.
    pub fn bucket_name<'a>(&'a self, env: RunEnv, default: &'a BucketNames) -> &'a str {
        self.bucket_names.as_ref().unwrap_or(default).for_env(env)
    }
}

/// Collects optional descriptor fields; `build` runs every check.
#[derive(Debug, Clone)]
pub struct SourceDescriptorBuilder {
    source_name: String,
    table_id: String,
    first_timestamp: DateTime<Tz>,
    primary_keys: Vec<String>,
    partition_date_only: bool,
    max_recaptures: usize,
    raw_filetype: String,
    schedule_cron: Option<String>,
    bucket_names: Option<BucketNames>,
    file_chunk_size: Option<usize>,
    api_url: Option<String>,
    flow_folder_name: Option<String>,
}

impl SourceDescriptorBuilder {
    pub fn primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn partition_date_only(mut self, date_only: bool) -> Self {
        self.partition_date_only = date_only;
        self
    }

    pub fn max_recaptures(mut self, max: usize) -> Self {
        self.max_recaptures = max;
        self
    }

    pub fn raw_filetype(mut self, filetype: &str) -> Self {
        self.raw_filetype = filetype.to_string();
        self
    }

    pub fn schedule_cron(mut self, expression: &str) -> Self {
        self.schedule_cron = Some(expression.to_string());
        self
    }

    pub fn bucket_names(mut self, buckets: BucketNames) -> Self {
        self.bucket_names = Some(buckets);
        self
    }

    pub fn file_chunk_size(mut self, chunk: usize) -> Self {
        self.file_chunk_size = Some(chunk);
        self
    }

    pub fn api_url(mut self, url: &str) -> Self {
        self.api_url = Some(url.to_string());
        self
    }

    pub fn flow_folder_name(mut self, folder: &str) -> Self {
        self.flow_folder_name = Some(folder.to_string());
        self
    }

    pub fn build(self) -> Result<SourceDescriptor> {
        let invalid = |reason: String| CaptureError::InvalidSource {
            table_id: self.table_id.clone(),
            reason,
        };

        check_identifier("source_name", &self.source_name).map_err(invalid)?;
        check_identifier("table_id", &self.table_id).map_err(invalid)?;

        if !RAW_FILETYPES.contains(&self.raw_filetype.as_str()) {
            return Err(invalid(format!(
                "raw_filetype must be one of {RAW_FILETYPES:?}, got '{}'",
                self.raw_filetype
            )));
        }
        if self.file_chunk_size == Some(0) {
            return Err(invalid("file_chunk_size must be greater than zero".into()));
        }
        if self.primary_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(invalid("primary_keys must not contain blank names".into()));
        }

        let expression = self.schedule_cron.clone().unwrap_or_else(|| {
            if self.partition_date_only {
                DAILY_CRON.to_string()
            } else {
                HOURLY_CRON.to_string()
            }
        });
        let cadence = Cadence::parse(&expression)?;

        // A daily partition cannot hold more than one capture per day.
        if self.partition_date_only {
            if let Some(gap) = cadence.shortest_gap(&self.first_timestamp, 32) {
                if gap < Duration::days(1) {
                    return Err(invalid(format!(
                        "cadence '{expression}' ticks every {}m but partitions are daily",
                        gap.num_minutes()
                    )));
                }
            }
        }

        Ok(SourceDescriptor {
            dataset_id: format!("source_{}", self.source_name),
            source_name: self.source_name,
            table_id: self.table_id,
            first_timestamp: self.first_timestamp,
            primary_keys: self.primary_keys,
            partition_date_only: self.partition_date_only,
            max_recaptures: self.max_recaptures,
            raw_filetype: self.raw_filetype,
            cadence,
            bucket_names: self.bucket_names,
            file_chunk_size: self.file_chunk_size,
            api_url: self.api_url,
            flow_folder_name: self.flow_folder_name,
        })
    }
}

fn check_identifier(field: &str, value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(format!("{field} '{value}' may only contain [a-z0-9_]"));
    }
    Ok(())
}
