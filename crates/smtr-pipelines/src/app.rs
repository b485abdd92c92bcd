use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use smtr_capture::{BlobStore, LocalBlobStore, SourceDescriptor};
use smtr_core::{PipelinesConfig, RunEnv};
use smtr_treatment::DbtSelector;
use tracing::info;

use crate::cli::RunArgs;

/// Everything a command needs: config, environment and validated entries.
pub struct App {
    pub config: PipelinesConfig,
    pub env: RunEnv,
    pub sources: HashMap<String, Arc<SourceDescriptor>>,
    pub selectors: HashMap<String, Arc<DbtSelector>>,
}

impl App {
    /// Load config, resolve the environment and validate every entry.
    pub fn load(config_path: Option<&PathBuf>, run: &RunArgs) -> anyhow::Result<Self> {
        let path = config_path.map(|p| p.to_string_lossy().into_owned());
        let config = PipelinesConfig::load(path.as_deref()).context("loading config")?;

        let env_name = run.env.as_deref().or(config.run.env.as_deref());
        let deployment = run
            .deployment_name
            .as_deref()
            .or(config.run.deployment_name.as_deref());
        let env = smtr_core::resolve_run_env(env_name, deployment, run.local || config.run.local)?;

        let sources = smtr_capture::build_sources(&config.sources)?;
        let selectors = smtr_treatment::build_selectors(&config.selectors, &sources)?;
        info!(
            %env,
            sources = sources.len(),
            selectors = selectors.len(),
            "pipelines ready"
        );

        Ok(Self {
            config,
            env,
            sources,
            selectors,
        })
    }

    pub fn source(&self, table_id: &str) -> anyhow::Result<Arc<SourceDescriptor>> {
        self.sources
            .get(table_id)
            .cloned()
            .ok_or_else(|| {
                smtr_capture::CaptureError::SourceNotFound {
                    table_id: table_id.to_string(),
                }
                .into()
            })
    }

    pub fn selector(&self, name: &str) -> anyhow::Result<Arc<DbtSelector>> {
        self.selectors.get(name).cloned().ok_or_else(|| {
            smtr_treatment::TreatmentError::SelectorNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Bucket of `source` in the current environment. Only writers create
    /// a missing bucket directory.
    pub fn store_for(
        &self,
        source: &SourceDescriptor,
        create: bool,
    ) -> smtr_capture::Result<Arc<dyn BlobStore>> {
        let bucket = source.bucket_name(self.env, &self.config.storage.bucket_names);
        let root = &self.config.storage.buckets_root;
        let store = if create {
            LocalBlobStore::create(root, bucket)?
        } else {
            LocalBlobStore::open(root, bucket)?
        };
        Ok(Arc::new(store))
    }

    pub fn data_folder(&self) -> PathBuf {
        PathBuf::from(&self.config.storage.data_folder)
    }

    /// Scheduled instant of this run, minute precision.
    pub fn scheduled(&self, explicit: Option<&str>) -> anyhow::Result<DateTime<Tz>> {
        Ok(smtr_core::time::scheduled_timestamp(explicit, Utc::now())?)
    }
}
