pub mod error;
pub mod service;

pub use error::ShortenerError;
pub use service::{
    BatchItem, BatchResultItem, BatchShortened, ListedUrl, Resolution, Shortened, ShortenStatus,
    ShortenerService, DEFAULT_MAX_KEY_ATTEMPTS,
};
