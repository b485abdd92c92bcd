//! Object storage layout.
//!
//! Keys follow `<mode>/<dataset_id>/<table_id>/<partition>/<filename>.<filetype>`
//! where `partition` is `data=YYYY-MM-DD` or `data=YYYY-MM-DD/hora=HH`.

use std::fmt;

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// `strftime` pattern of capture filenames (no extension).
pub const FILENAME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Normalized source files are always CSV.
pub const SOURCE_FILETYPE: &str = "csv";

/// Hive-style partition key derived from a platform-timezone timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition(String);

impl Partition {
    pub fn for_timestamp(ts: &DateTime<Tz>, date_only: bool) -> Self {
        let date = ts.format("data=%Y-%m-%d");
        if date_only {
            Self(date.to_string())
        } else {
            Self(format!("{date}/{}", ts.format("hora=%H")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level folder of a staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Extractor output as received, possibly split into pages.
    Raw,
    /// Normalized single-file output; its presence marks a finished capture.
    Source,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Raw => "raw",
            StorageMode::Source => "source",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Filename (without extension) of the capture taken at `ts`.
pub fn capture_filename(ts: &DateTime<Tz>) -> String {
    ts.format(FILENAME_FORMAT).to_string()
}

pub fn object_key(
    mode: StorageMode,
    dataset_id: &str,
    table_id: &str,
    partition: &Partition,
    filename: &str,
    filetype: &str,
) -> String {
    format!("{mode}/{dataset_id}/{table_id}/{partition}/{filename}.{filetype}")
}

/// Listing prefix covering every finished capture of a table.
pub fn marker_prefix(dataset_id: &str, table_id: &str) -> String {
    format!("{}/{dataset_id}/{table_id}/data=", StorageMode::Source)
}
