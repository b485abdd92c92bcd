use thiserror::Error;

/// Errors that can occur while describing, planning or running a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A source entry failed validation when its descriptor was built.
    #[error("Invalid source {table_id}: {reason}")]
    InvalidSource { table_id: String, reason: String },

    /// The cadence expression could not be parsed.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// No source with the given table id is configured.
    #[error("Source not found: {table_id}")]
    SourceNotFound { table_id: String },

    /// The recapture lookback is negative or out of range.
    #[error("Invalid recapture lookback of {days} days")]
    InvalidLookback { days: i64 },

    #[error(transparent)]
    Core(#[from] smtr_core::CoreError),

    /// Object storage could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Upload refused because the object already exists.
    #[error("Object already exists: {key}")]
    ObjectExists { key: String },

    /// A record lacks one of the source's primary key columns.
    #[error("Record {index} is missing primary key '{key}'")]
    MissingPrimaryKey { index: usize, key: String },

    /// The extractor failed to produce records.
    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
