//! Error taxonomy shared by every Rota crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RotaError {
    /// Malformed configuration: bad syntax, unknown pool/notifier reference,
    /// invalid recurrence. Fatal to the reload that produced it.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure writing or reading job/run state on disk.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    #[error("Pool not found: {name}")]
    PoolNotFound { name: String },

    /// The scheduler event loop is gone (shut down or panicked).
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}

impl RotaError {
    /// Short error code string for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            RotaError::Config(_) => "CONFIG_ERROR",
            RotaError::Serialization(_) => "SERIALIZATION_ERROR",
            RotaError::Persistence(_) => "PERSISTENCE_ERROR",
            RotaError::JobNotFound { .. } => "JOB_NOT_FOUND",
            RotaError::PoolNotFound { .. } => "POOL_NOT_FOUND",
            RotaError::Unavailable(_) => "UNAVAILABLE",
        }
    }

    /// Whether the error means the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RotaError::JobNotFound { .. } | RotaError::PoolNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RotaError>;
