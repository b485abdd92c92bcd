use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::env::RunEnv;

pub const DEFAULT_CONFIG_PATH: &str = "smtr.toml";
pub const DEFAULT_DATA_FOLDER: &str = "data";
pub const DEFAULT_BUCKETS_ROOT: &str = "buckets";
pub const DEFAULT_PROD_BUCKET: &str = "rj-smtr";
pub const DEFAULT_DEV_BUCKET: &str = "rj-smtr-dev";
pub const DEFAULT_MAX_PARALLEL_CAPTURES: usize = 4;
pub const DEFAULT_RECAPTURE_DAYS: i64 = 2;
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DBT_TIMEOUT_SECS: u64 = 3_600;

/// Top-level config (smtr.toml + SMTR_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelinesConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
    #[serde(default)]
    pub dbt: DbtConfig,
    /// Raw source table entries, validated into descriptors by `smtr-capture`.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Raw materialization selector entries, validated by `smtr-treatment`.
    #[serde(default)]
    pub selectors: Vec<SelectorConfig>,
}

/// How the current process should pick its environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// `prod` or `dev`. Ignored when `deployment_name` is set.
    pub env: Option<String>,
    /// Orchestrator deployment name, e.g. `capture__jae_transacao--prod`.
    pub deployment_name: Option<String>,
    /// Set on developer machines; lets runs without an env default to dev.
    #[serde(default)]
    pub local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local staging folder for raw and source files.
    #[serde(default = "default_data_folder")]
    pub data_folder: String,
    /// Directory under which each bucket is a sub-directory.
    #[serde(default = "default_buckets_root")]
    pub buckets_root: String,
    #[serde(default)]
    pub bucket_names: BucketNames,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_folder: default_data_folder(),
            buckets_root: default_buckets_root(),
            bucket_names: BucketNames::default(),
        }
    }
}

/// Bucket name per environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketNames {
    pub prod: String,
    pub dev: String,
}

impl BucketNames {
    pub fn for_env(&self, env: RunEnv) -> &str {
        match env {
            RunEnv::Prod => &self.prod,
            RunEnv::Dev => &self.dev,
        }
    }
}

impl Default for BucketNames {
    fn default() -> Self {
        Self {
            prod: DEFAULT_PROD_BUCKET.to_string(),
            dev: DEFAULT_DEV_BUCKET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Upper bound on timestamps captured concurrently in one run.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Lookback used when a run asks for recapture without explicit timestamps.
    #[serde(default = "default_recapture_days")]
    pub recapture_days: i64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL_CAPTURES,
            recapture_days: DEFAULT_RECAPTURE_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// At most this many outbound requests in flight.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_REQUESTS,
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbtConfig {
    #[serde(default = "default_dbt_binary")]
    pub binary: String,
    #[serde(default = "default_dbt_project_dir")]
    pub project_dir: String,
    pub profiles_dir: Option<String>,
    #[serde(default = "default_dbt_timeout")]
    pub timeout_secs: u64,
    /// SQLite file holding the last materialized instant per selector.
    #[serde(default = "default_state_db")]
    pub state_db: String,
}

impl Default for DbtConfig {
    fn default() -> Self {
        Self {
            binary: default_dbt_binary(),
            project_dir: default_dbt_project_dir(),
            profiles_dir: None,
            timeout_secs: DEFAULT_DBT_TIMEOUT_SECS,
            state_db: default_state_db(),
        }
    }
}

/// One extractable table as written in the config file.
///
/// Optional fields fall back to per-granularity defaults when the
/// descriptor is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_name: String,
    pub table_id: String,
    /// Earliest valid capture instant (RFC 3339 or platform wall clock).
    pub first_timestamp: String,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    pub partition_date_only: Option<bool>,
    pub max_recaptures: Option<usize>,
    pub raw_filetype: Option<String>,
    /// 5-field cron (minute precision) or 6/7-field cron with seconds.
    pub schedule_cron: Option<String>,
    pub bucket_names: Option<BucketNames>,
    /// Maximum records per raw page file.
    pub file_chunk_size: Option<usize>,
    /// Endpoint read by the generic HTTP extractor.
    pub api_url: Option<String>,
    pub flow_folder_name: Option<String>,
}

/// One materialization selector as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub name: String,
    pub initial_datetime: String,
    pub flow_folder_name: Option<String>,
    #[serde(default)]
    pub incremental_delay_hours: i64,
    /// `source:<source_name>.<table_id>` or `selector:<name>`.
    #[serde(default)]
    pub data_sources: Vec<String>,
    pub post_test: Option<DbtTestConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbtTestConfig {
    pub test_select: String,
    /// Run tests over whole days instead of the exact window.
    #[serde(default)]
    pub truncate_date: bool,
    /// Local `HH:MM` at which scheduled runs also execute the tests.
    pub test_scheduled_time: Option<String>,
}

fn default_data_folder() -> String {
    DEFAULT_DATA_FOLDER.to_string()
}
fn default_buckets_root() -> String {
    DEFAULT_BUCKETS_ROOT.to_string()
}
fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL_CAPTURES
}
fn default_recapture_days() -> i64 {
    DEFAULT_RECAPTURE_DAYS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_REQUESTS
}
fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_dbt_binary() -> String {
    "dbt".to_string()
}
fn default_dbt_project_dir() -> String {
    ".".to_string()
}
fn default_dbt_timeout() -> u64 {
    DEFAULT_DBT_TIMEOUT_SECS
}
fn default_state_db() -> String {
    "smtr-state.db".to_string()
}

impl PipelinesConfig {
    /// Load config from a TOML file with SMTR_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `SMTR_STORAGE__DATA_FOLDER=/tmp/data`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);

        let config: PipelinesConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SMTR_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        tracing::debug!(
            path,
            sources = config.sources.len(),
            selectors = config.selectors.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn source(&self, table_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.table_id == table_id)
    }

    pub fn selector(&self, name: &str) -> Option<&SelectorConfig> {
        self.selectors.iter().find(|s| s.name == name)
    }
}
