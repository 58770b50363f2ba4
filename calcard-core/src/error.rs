//! Error types for calcard.

use thiserror::Error;

/// Errors that can occur in calcard operations.
#[derive(Error, Debug)]
pub enum CalCardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ICS parse error: {0}")]
    IcsParse(String),

    #[error("ICS generation error: {0}")]
    IcsGenerate(String),

    #[error("Invalid occurrence key '{0}'. Expected YYYYMMDDThhmmssZ")]
    InvalidOccurrenceKey(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No master component found in event '{0}'")]
    MissingMaster(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Entity tag mismatch for '{0}': the resource was modified concurrently")]
    Conflict(String),

    /// The client's sync token does not correspond to any retained checkpoint.
    /// Clients must restart with a full sync rather than retry.
    #[error("Invalid or expired sync token: {0}")]
    InvalidSyncToken(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalCardError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CalCardError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias for calcard operations.
pub type CalCardResult<T> = Result<T, CalCardError>;
