use crate::delete::{DeletePipelineConfig, DEFAULT_DELETE_WORKERS};
use crate::journal::{JournalConfig, JournalStorage};
use crate::postgres::{PostgresConfig, PostgresStorage};
use async_trait::async_trait;
use snip_core::{BatchOutcome, DeleteRequest, Result, Storage, StoreOutcome, UrlRecord};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use tracing::info;
use typed_builder::TypedBuilder;

/// Selects and configures the storage engine.
///
/// A database DSN wins over a journal path; with neither, records are kept
/// in memory only.
#[derive(Debug, Clone, TypedBuilder)]
pub struct StorageConfig {
    #[builder(default, setter(strip_option, into))]
    database_dsn: Option<String>,
    #[builder(default, setter(strip_option, into))]
    file_storage_path: Option<PathBuf>,
    #[builder(default = DEFAULT_DELETE_WORKERS)]
    delete_workers: usize,
    #[builder(default = 10)]
    max_connections: u32,
}

impl StorageConfig {
    /// Builds a config from optional settings, treating empty strings as unset.
    pub fn from_options(
        database_dsn: Option<String>,
        file_storage_path: Option<PathBuf>,
        delete_workers: usize,
    ) -> Self {
        Self {
            database_dsn: database_dsn.filter(|dsn| !dsn.is_empty()),
            file_storage_path: file_storage_path.filter(|path| !path.as_os_str().is_empty()),
            delete_workers,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Memory,
    Journal,
    Postgres,
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Memory => write!(f, "memory"),
            StorageKind::Journal => write!(f, "journal"),
            StorageKind::Postgres => write!(f, "postgres"),
        }
    }
}

/// The engine chosen at startup. It is never switched afterwards.
pub enum AnyStorage {
    Journal(JournalStorage),
    Postgres(PostgresStorage),
}

impl AnyStorage {
    pub async fn from_config(config: StorageConfig) -> Result<Self> {
        let storage = match (config.database_dsn, config.file_storage_path) {
            (Some(dsn), _) => {
                let pipeline = DeletePipelineConfig::builder()
                    .workers(config.delete_workers)
                    .build();
                let postgres = PostgresConfig::builder()
                    .dsn(dsn)
                    .max_connections(config.max_connections)
                    .delete_pipeline(pipeline)
                    .build();
                AnyStorage::Postgres(PostgresStorage::connect(postgres).await?)
            }
            (None, Some(path)) => {
                let journal = JournalConfig::builder().path(path).build();
                AnyStorage::Journal(JournalStorage::open(journal)?)
            }
            (None, None) => AnyStorage::Journal(JournalStorage::in_memory()),
        };

        info!(storage = %storage.kind(), "storage engine ready");
        Ok(storage)
    }

    pub fn kind(&self) -> StorageKind {
        match self {
            AnyStorage::Journal(journal) if journal.is_persistent() => StorageKind::Journal,
            AnyStorage::Journal(_) => StorageKind::Memory,
            AnyStorage::Postgres(_) => StorageKind::Postgres,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            AnyStorage::Journal(journal) => journal.ping().await,
            AnyStorage::Postgres(postgres) => postgres.ping().await,
        }
    }

    /// Waits for scheduled deletions and releases the backend.
    pub async fn shutdown(&self) {
        match self {
            AnyStorage::Journal(journal) => journal.shutdown().await,
            AnyStorage::Postgres(postgres) => postgres.shutdown().await,
        }
    }
}

#[async_trait]
impl Storage for AnyStorage {
    async fn load(&self, short_key: &str) -> Result<Option<UrlRecord>> {
        match self {
            AnyStorage::Journal(journal) => journal.load(short_key).await,
            AnyStorage::Postgres(postgres) => postgres.load(short_key).await,
        }
    }

    async fn store(&self, record: UrlRecord) -> Result<StoreOutcome> {
        match self {
            AnyStorage::Journal(journal) => journal.store(record).await,
            AnyStorage::Postgres(postgres) => postgres.store(record).await,
        }
    }

    async fn store_batch(&self, records: Vec<(String, UrlRecord)>) -> Result<BatchOutcome> {
        match self {
            AnyStorage::Journal(journal) => journal.store_batch(records).await,
            AnyStorage::Postgres(postgres) => postgres.store_batch(records).await,
        }
    }

    async fn list(&self, user_id: &str) -> Result<Vec<UrlRecord>> {
        match self {
            AnyStorage::Journal(journal) => journal.list(user_id).await,
            AnyStorage::Postgres(postgres) => postgres.list(user_id).await,
        }
    }

    async fn delete(&self, requests: Vec<DeleteRequest>) -> Result<()> {
        match self {
            AnyStorage::Journal(journal) => journal.delete(requests).await,
            AnyStorage::Postgres(postgres) => postgres.delete(requests).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn no_settings_selects_memory() {
        let storage = AnyStorage::from_config(StorageConfig::builder().build())
            .await
            .unwrap();

        assert_eq!(storage.kind(), StorageKind::Memory);
        storage.ping().await.unwrap();
    }

    #[tokio::test]
    async fn file_path_selects_journal() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::builder()
            .file_storage_path(dir.path().join("urls.json"))
            .build();

        let storage = AnyStorage::from_config(config).await.unwrap();

        assert_eq!(storage.kind(), StorageKind::Journal);
        storage
            .store(UrlRecord::new("abc123", "https://a.example", "alice"))
            .await
            .unwrap();
        storage.shutdown().await;
        assert!(dir.path().join("urls.json").exists());
    }

    #[test]
    fn empty_options_are_ignored() {
        let config = StorageConfig::from_options(Some(String::new()), Some(PathBuf::new()), 4);

        assert!(config.database_dsn.is_none());
        assert!(config.file_storage_path.is_none());
        assert_eq!(config.delete_workers, 4);
    }
}
