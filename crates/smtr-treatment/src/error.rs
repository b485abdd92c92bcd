use thiserror::Error;

/// Errors that can occur while planning or running a materialization.
#[derive(Debug, Error)]
pub enum TreatmentError {
    /// A selector entry failed validation.
    #[error("Invalid selector {name}: {reason}")]
    InvalidSelector { name: String, reason: String },

    /// No selector with the given name is configured.
    #[error("Selector not found: {name}")]
    SelectorNotFound { name: String },

    /// The resolved window starts after it ends.
    #[error("Invalid materialization window: start {start} is after end {end}")]
    InvalidWindow { start: String, end: String },

    /// Upstream captures or selectors do not cover the window yet.
    #[error("Selector {selector} has incomplete inputs: {}", .pending.join("; "))]
    IncompleteInputs {
        selector: String,
        pending: Vec<String>,
    },

    /// dbt ran and exited unsuccessfully.
    #[error("dbt {command} exited with code {exit_code}")]
    DbtFailed { command: String, exit_code: i32 },

    /// dbt could not be started.
    #[error("Failed to spawn dbt: {0}")]
    Spawn(String),

    /// dbt did not finish within its time budget.
    #[error("dbt timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Capture(#[from] smtr_capture::CaptureError),

    #[error(transparent)]
    Core(#[from] smtr_core::CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TreatmentError>;
