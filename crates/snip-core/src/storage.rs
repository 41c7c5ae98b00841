use crate::error::Result;
use crate::record::{DeleteRequest, UrlRecord};
use async_trait::async_trait;
use std::collections::HashMap;

/// Result of a single [`Storage::store`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The candidate record was persisted as given.
    Created,
    /// A live record already maps the same original URL; it is returned
    /// unchanged and the candidate was discarded.
    Conflict(UrlRecord),
}

impl StoreOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreOutcome::Conflict(_))
    }
}

/// Result of a [`Storage::store_batch`] call.
///
/// Batches abort on the first conflicting item, so `conflicts` holds the
/// conflicts seen up to that point, keyed by correlation id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub conflicts: HashMap<String, UrlRecord>,
}

impl BatchOutcome {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// The contract every storage engine implements.
///
/// Engines guarantee that at most one live record exists per original URL,
/// never reuse a short key, and only ever tombstone records.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Looks up a record by short key.
    ///
    /// Tombstoned records are returned with `is_deleted` set; `None` means
    /// the key was never stored.
    async fn load(&self, short_key: &str) -> Result<Option<UrlRecord>>;

    /// Persists a candidate record unless a live record already holds its URL.
    async fn store(&self, record: UrlRecord) -> Result<StoreOutcome>;

    /// Stores `(correlation_id, record)` pairs in order, stopping at the
    /// first URL conflict.
    async fn store_batch(&self, records: Vec<(String, UrlRecord)>) -> Result<BatchOutcome>;

    /// Returns the live records owned by `user_id`, in no particular order.
    async fn list(&self, user_id: &str) -> Result<Vec<UrlRecord>>;

    /// Schedules tombstones and returns before they are applied.
    ///
    /// A request only takes effect when both the key and the owning user
    /// match the stored record. Failures while applying are logged, not
    /// reported here.
    async fn delete(&self, requests: Vec<DeleteRequest>) -> Result<()>;
}
