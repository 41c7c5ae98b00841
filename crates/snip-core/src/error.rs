use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Failures surfaced by storage engines.
///
/// URL conflicts and unknown keys are regular outcomes, not errors.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("short key already taken: {0}")]
    DuplicateKey(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("journal i/o failed: {0}")]
    Io(String),
    #[error("storage initialization failed: {0}")]
    Initialization(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
