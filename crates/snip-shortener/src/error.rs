use snip_core::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ShortenerError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("batch is empty")]
    EmptyBatch,
    #[error("no short keys to delete")]
    EmptyDeleteRequest,
    #[error("user id is required")]
    MissingUserId,
    #[error("no free short key after {0} attempts")]
    KeySpaceExhausted(usize),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
