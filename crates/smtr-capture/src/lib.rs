//! `smtr-capture`: source descriptors, capture contexts and recapture planning.
//!
//! # Overview
//!
//! A [`SourceDescriptor`] describes one upstream table. Each run binds it to
//! an instant through a [`CaptureContext`], which fixes the partition and
//! every file path. The [`RecapturePlanner`] compares the source's cadence
//! with the finished captures in object storage and proposes the missing
//! instants, newest first. [`CaptureRunner`] fans a run out over its
//! timestamps.
//!
//! # Storage layout
//!
//! | Mode     | Key                                                               |
//! |----------|-------------------------------------------------------------------|
//! | `raw`    | `raw/<dataset>/<table>/<partition>/<YYYY-MM-DD-HH-MM-SS>_<page>.<type>` |
//! | `source` | `source/<dataset>/<table>/<partition>/<YYYY-MM-DD-HH-MM-SS>.csv`  |

pub mod cadence;
pub mod context;
pub mod error;
pub mod extract;
pub mod partition;
pub mod recapture;
pub mod runner;
pub mod source;
pub mod stage;
pub mod storage;

pub use cadence::Cadence;
pub use context::CaptureContext;
pub use error::{CaptureError, Result};
pub use extract::{Extractor, HttpExtractor, Record};
pub use partition::{Partition, StorageMode};
pub use recapture::{RecapturePlanner, RecaptureWindow};
pub use runner::{CaptureReport, CaptureRequest, CaptureRunner};
pub use source::SourceDescriptor;
pub use storage::{BlobStore, IfExists, LocalBlobStore};

use std::collections::HashMap;
use std::sync::Arc;

use smtr_core::config::SourceConfig;

/// Validated descriptors keyed by table id.
pub fn build_sources(configs: &[SourceConfig]) -> Result<HashMap<String, Arc<SourceDescriptor>>> {
    let mut sources = HashMap::with_capacity(configs.len());
    for config in configs {
        let source = SourceDescriptor::from_config(config)?;
        let table_id = source.table_id().to_string();
        if sources.insert(table_id.clone(), Arc::new(source)).is_some() {
            return Err(CaptureError::InvalidSource {
                table_id,
                reason: "declared more than once".to_string(),
            });
        }
    }
    Ok(sources)
}
