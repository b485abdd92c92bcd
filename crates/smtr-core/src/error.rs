use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid run environment: {value} (expected prod or dev)")]
    InvalidEnv { value: String },

    #[error("Invalid timestamp: {value}")]
    InvalidTimestamp { value: String },
}

impl CoreError {
    /// Short error code string printed to operators next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidEnv { .. } => "INVALID_ENV",
            CoreError::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
