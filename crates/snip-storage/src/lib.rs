//! Storage engines for the snip URL shortener.
//!
//! Two interchangeable implementations of [`Storage`]:
//!
//! - [`JournalStorage`]: an in-process map, optionally backed by an
//!   append-only JSON-lines journal that is replayed on open.
//! - [`PostgresStorage`]: a pooled PostgreSQL backend with constraint-based
//!   deduplication and transactional batch inserts.
//!
//! Both schedule deletions through the shared [`DeletePipeline`]. The engine
//! is picked once at startup by [`AnyStorage::from_config`].

pub mod backend;
pub mod delete;
pub mod journal;
pub mod postgres;

pub use backend::{AnyStorage, StorageConfig, StorageKind};
pub use delete::{DeletePipeline, DeletePipelineConfig, DeleteReport, TombstoneSink};
pub use journal::{JournalConfig, JournalStorage, ReplayStats};
pub use postgres::{PostgresConfig, PostgresStorage};
pub use snip_core::{
    BatchOutcome, DeleteRequest, Storage, StorageError, StoreOutcome, UrlRecord,
};

use snip_core::Result;

/// Rejects candidates that would break lookups: both the key and the URL
/// must be non-empty.
pub(crate) fn validate(record: &UrlRecord) -> Result<()> {
    if record.short_key.is_empty() {
        return Err(StorageError::InvalidRecord("short key is empty".to_string()));
    }
    if record.original_url.is_empty() {
        return Err(StorageError::InvalidRecord(
            "original url is empty".to_string(),
        ));
    }
    Ok(())
}
