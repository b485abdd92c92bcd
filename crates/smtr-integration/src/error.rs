use thiserror::Error;

/// Errors raised while preparing outbound requests.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// A header name or value could not be used.
    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, IntegrationError>;
