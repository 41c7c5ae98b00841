use serde::{Deserialize, Serialize};

/// A persisted mapping between a short key and the URL it stands for.
///
/// Records are only ever exchanged by value; engines never hand out
/// references into their internal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    /// The key used for resolution.
    pub short_key: String,
    /// The original URL that was shortened.
    pub original_url: String,
    /// Opaque owner identifier, used to partition listing and deletion.
    pub user_id: String,
    /// Tombstone flag. Deleted records stay readable by key.
    #[serde(default, alias = "DeletedFlag")]
    pub is_deleted: bool,
}

impl UrlRecord {
    /// Creates a live record.
    pub fn new(
        short_key: impl Into<String>,
        original_url: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            short_key: short_key.into(),
            original_url: original_url.into(),
            user_id: user_id.into(),
            is_deleted: false,
        }
    }

    /// Whether this record still takes part in resolution and deduplication.
    pub fn is_live(&self) -> bool {
        !self.is_deleted
    }

    /// Whether a tombstone request is allowed to mark this record.
    pub fn is_owned_by(&self, request: &DeleteRequest) -> bool {
        self.short_key == request.short_key && self.user_id == request.user_id
    }
}

/// A request to tombstone the record at `short_key` on behalf of `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub short_key: String,
    pub user_id: String,
}

impl DeleteRequest {
    pub fn new(short_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            short_key: short_key.into(),
            user_id: user_id.into(),
        }
    }
}

/// Composes the public short URL for a key.
pub fn short_url(base_url: &str, short_key: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), short_key)
}
