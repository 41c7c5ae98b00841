use crate::delete::{DeletePipeline, DeletePipelineConfig, TombstoneSink};
use crate::validate;
use async_trait::async_trait;
use snip_core::{
    BatchOutcome, DeleteRequest, Result, Storage, StorageError, StoreOutcome, UrlRecord,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Row};
use std::sync::Arc;
use tracing::{debug, error, info};
use typed_builder::TypedBuilder;

const SCHEMA: &str = include_str!("../ddl/postgres/urls.sql");

/// How often a store retries when the conflicting row disappears between
/// the insert and the lookup (it was tombstoned concurrently).
const CONFLICT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, TypedBuilder)]
pub struct PostgresConfig {
    #[builder(setter(into))]
    dsn: String,
    #[builder(default = 10)]
    max_connections: u32,
    #[builder(default)]
    delete_pipeline: DeletePipelineConfig,
}

/// PostgreSQL implementation of the storage contract.
///
/// Uniqueness of `original_url` is enforced by a partial unique index over
/// live rows, so a tombstoned URL can be shortened again under a new key.
/// Short keys are the primary key and are never reused, tombstoned or not.
pub struct PostgresStorage {
    pool: PgPool,
    pipeline: DeletePipeline<PostgresSink>,
}

impl PostgresStorage {
    /// Creates a storage from an existing pool and makes sure the schema exists.
    pub async fn new(pool: PgPool, delete_pipeline: DeletePipelineConfig) -> Result<Self> {
        ensure_schema(&pool).await?;

        let sink = PostgresSink { pool: pool.clone() };
        Ok(Self {
            pool,
            pipeline: DeletePipeline::new(Arc::new(sink), delete_pipeline),
        })
    }

    /// Opens a connection pool and makes sure the schema exists.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.dsn)
            .await
            .map_err(|e| StorageError::Initialization(format!("cannot connect: {e}")))?;

        info!(
            max_connections = config.max_connections,
            delete_workers = config.delete_pipeline.workers(),
            "connected to postgres"
        );

        Self::new(pool, config.delete_pipeline).await
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Waits for scheduled deletions, then closes the pool.
    pub async fn shutdown(&self) {
        self.pipeline.drain().await;
        self.pool.close().await;
    }
}

async fn ensure_schema(pool: &PgPool) -> Result<()> {
    match sqlx::raw_sql(SCHEMA).execute(pool).await {
        Ok(_) => Ok(()),
        Err(err) if is_already_exists(&err) => {
            debug!(error = %err, "schema already present");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "schema creation failed");
            Err(StorageError::Initialization(format!(
                "cannot create schema: {err}"
            )))
        }
    }
}

/// `duplicate_table`, `duplicate_object`, and the catalog unique violation
/// raised when two processes race on `CREATE ... IF NOT EXISTS`.
fn is_already_exists(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| matches!(code.as_ref(), "42P07" | "42710" | "23505"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

fn record_from_row(row: &PgRow) -> Result<UrlRecord> {
    Ok(UrlRecord {
        short_key: row.try_get("short_key").map_err(map_sqlx_error)?,
        original_url: row.try_get("original_url").map_err(map_sqlx_error)?,
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        is_deleted: row.try_get("is_deleted").map_err(map_sqlx_error)?,
    })
}

/// Inserts the record unless a live row already holds its URL.
/// Returns whether a row was written.
async fn insert<'e, E: PgExecutor<'e>>(executor: E, record: &UrlRecord) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO urls (short_key, original_url, user_id, is_deleted)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (original_url) WHERE NOT is_deleted DO NOTHING
        "#,
    )
    .bind(record.short_key.as_str())
    .bind(record.original_url.as_str())
    .bind(record.user_id.as_str())
    .bind(record.is_deleted)
    .execute(executor)
    .await;

    match result {
        Ok(done) => Ok(done.rows_affected() > 0),
        Err(err) if is_unique_violation(&err) => {
            Err(StorageError::DuplicateKey(record.short_key.clone()))
        }
        Err(err) => {
            error!(error = %err, short_key = %record.short_key, "insert failed");
            Err(map_sqlx_error(err))
        }
    }
}

async fn find_live_by_url<'e, E: PgExecutor<'e>>(
    executor: E,
    original_url: &str,
) -> Result<Option<UrlRecord>> {
    let row = sqlx::query(
        r#"
        SELECT short_key, original_url, user_id, is_deleted
        FROM urls
        WHERE original_url = $1
          AND NOT is_deleted
        LIMIT 1
        "#,
    )
    .bind(original_url)
    .fetch_optional(executor)
    .await
    .map_err(map_sqlx_error)?;

    row.as_ref().map(record_from_row).transpose()
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn load(&self, short_key: &str) -> Result<Option<UrlRecord>> {
        let row = sqlx::query(
            r#"
            SELECT short_key, original_url, user_id, is_deleted
            FROM urls
            WHERE short_key = $1
            "#,
        )
        .bind(short_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn store(&self, record: UrlRecord) -> Result<StoreOutcome> {
        validate(&record)?;

        for _ in 0..CONFLICT_ATTEMPTS {
            if insert(&self.pool, &record).await? {
                return Ok(StoreOutcome::Created);
            }
            if let Some(existing) = find_live_by_url(&self.pool, &record.original_url).await? {
                return Ok(StoreOutcome::Conflict(existing));
            }
            debug!(original_url = %record.original_url, "conflicting row vanished, retrying");
        }

        Err(StorageError::Query(format!(
            "could not settle conflict for {} after {CONFLICT_ATTEMPTS} attempts",
            record.original_url
        )))
    }

    async fn store_batch(&self, records: Vec<(String, UrlRecord)>) -> Result<BatchOutcome> {
        for (_, record) in &records {
            validate(record)?;
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut outcome = BatchOutcome::default();

        // any error drops `tx`, which rolls the whole batch back
        for (correlation_id, record) in records {
            if insert(&mut *tx, &record).await? {
                continue;
            }

            let existing = find_live_by_url(&mut *tx, &record.original_url)
                .await?
                .ok_or_else(|| {
                    StorageError::Query(format!(
                        "conflict on {} without a live row",
                        record.original_url
                    ))
                })?;
            outcome.conflicts.insert(correlation_id, existing);
            break;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<UrlRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT short_key, original_url, user_id, is_deleted
            FROM urls
            WHERE user_id = $1
              AND NOT is_deleted
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn delete(&self, requests: Vec<DeleteRequest>) -> Result<()> {
        debug!(count = requests.len(), "scheduling tombstones");
        drop(self.pipeline.submit(requests));
        Ok(())
    }
}

struct PostgresSink {
    pool: PgPool,
}

#[async_trait]
impl TombstoneSink for PostgresSink {
    async fn apply(&self, batch: Vec<DeleteRequest>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut tombstoned = 0;

        for request in &batch {
            let done = sqlx::query(
                r#"
                UPDATE urls
                SET is_deleted = TRUE
                WHERE short_key = $1
                  AND user_id = $2
                  AND NOT is_deleted
                "#,
            )
            .bind(request.short_key.as_str())
            .bind(request.user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            tombstoned += done.rows_affected();
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(tombstoned)
    }
}
