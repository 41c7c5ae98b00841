use crate::error::ShortenerError;
use serde::{Deserialize, Serialize};
use snip_core::{short_url, DeleteRequest, Storage, StorageError, StoreOutcome, UrlRecord};
use snip_generator::Generator;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MAX_KEY_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortenStatus {
    Created,
    Conflict,
}

/// Result of shortening a single URL.
///
/// On `Conflict` the key is the one already serving the URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortened {
    pub short_key: String,
    pub short_url: String,
    pub status: ShortenStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchItem {
    pub correlation_id: String,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResultItem {
    pub correlation_id: String,
    pub short_url: String,
}

/// Result of a batch.
///
/// When `conflict` is set, `items` holds only the conflicting entries,
/// each pointing at the URL's existing short URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchShortened {
    pub conflict: bool,
    pub items: Vec<BatchResultItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedUrl {
    pub short_url: String,
    pub original_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Redirect(String),
    Gone,
    NotFound,
}

/// URL shortening on top of a [`Storage`] engine and a key [`Generator`].
///
/// Generated keys are checked against the engine before use and retried on
/// collision, up to `max_key_attempts` times.
pub struct ShortenerService<S, G> {
    storage: Arc<S>,
    generator: Arc<G>,
    base_url: String,
    max_key_attempts: usize,
}

impl<S: Storage, G: Generator> ShortenerService<S, G> {
    pub fn new(storage: S, generator: G, base_url: impl Into<String>) -> Self {
        Self {
            storage: Arc::new(storage),
            generator: Arc::new(generator),
            base_url: base_url.into(),
            max_key_attempts: DEFAULT_MAX_KEY_ATTEMPTS,
        }
    }

    pub fn with_max_key_attempts(mut self, attempts: usize) -> Self {
        self.max_key_attempts = attempts.max(1);
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Validates that the URL has an http(s) scheme and a host.
    fn validate_url(url: &str) -> Result<(), ShortenerError> {
        if url.is_empty() {
            return Err(ShortenerError::InvalidUrl(
                "URL cannot be empty".to_string(),
            ));
        }

        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(ShortenerError::InvalidUrl(format!(
                "URL must have a scheme and host: {url}"
            )));
        };

        let scheme = scheme.to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ShortenerError::InvalidUrl(format!(
                "URL scheme must be http or https: {scheme}"
            )));
        }

        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(ShortenerError::InvalidUrl(format!(
                "URL must have a host: {url}"
            )));
        }

        Ok(())
    }

    fn require_user(user_id: &str) -> Result<(), ShortenerError> {
        if user_id.is_empty() {
            return Err(ShortenerError::MissingUserId);
        }
        Ok(())
    }

    /// Draws a key that is not taken yet, or `None` when every draw collided.
    async fn free_key(&self) -> Result<Option<String>, ShortenerError> {
        for _ in 0..self.max_key_attempts {
            let key = self.generator.generate();
            if self.storage.load(&key).await?.is_none() {
                return Ok(Some(key));
            }
            debug!(short_key = %key, "generated key already taken");
        }
        Ok(None)
    }

    fn shortened(&self, short_key: String, status: ShortenStatus) -> Shortened {
        Shortened {
            short_url: short_url(&self.base_url, &short_key),
            short_key,
            status,
        }
    }

    pub async fn shorten(
        &self,
        original_url: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<Shortened, ShortenerError> {
        self.store(UrlRecord::new("", original_url, user_id)).await
    }

    /// Stores `record`, generating its key first when it has none.
    ///
    /// A record carrying a key is stored as-is; a taken key is reported as
    /// [`StorageError::DuplicateKey`].
    pub async fn store(&self, record: UrlRecord) -> Result<Shortened, ShortenerError> {
        Self::validate_url(&record.original_url)?;

        if !record.short_key.is_empty() {
            return match self.storage.store(record.clone()).await? {
                StoreOutcome::Created => {
                    Ok(self.shortened(record.short_key, ShortenStatus::Created))
                }
                StoreOutcome::Conflict(existing) => {
                    Ok(self.shortened(existing.short_key, ShortenStatus::Conflict))
                }
            };
        }

        for _ in 0..self.max_key_attempts {
            let Some(key) = self.free_key().await? else {
                break;
            };

            let candidate = UrlRecord {
                short_key: key.clone(),
                ..record.clone()
            };
            match self.storage.store(candidate).await {
                Ok(StoreOutcome::Created) => {
                    return Ok(self.shortened(key, ShortenStatus::Created));
                }
                Ok(StoreOutcome::Conflict(existing)) => {
                    return Ok(self.shortened(existing.short_key, ShortenStatus::Conflict));
                }
                Err(StorageError::DuplicateKey(key)) => {
                    debug!(short_key = %key, "key taken concurrently, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(attempts = self.max_key_attempts, "could not find a free short key");
        Err(ShortenerError::KeySpaceExhausted(self.max_key_attempts))
    }

    /// Shortens every item under `user_id`, stopping at the first URL that
    /// is already shortened.
    pub async fn shorten_batch(
        &self,
        items: Vec<BatchItem>,
        user_id: impl Into<String>,
    ) -> Result<BatchShortened, ShortenerError> {
        if items.is_empty() {
            return Err(ShortenerError::EmptyBatch);
        }
        for item in &items {
            Self::validate_url(&item.original_url)?;
        }
        let user_id = user_id.into();

        for _ in 0..self.max_key_attempts {
            let Some(keys) = self.free_keys(items.len()).await? else {
                break;
            };

            let records = items
                .iter()
                .zip(&keys)
                .map(|(item, key)| {
                    (
                        item.correlation_id.clone(),
                        UrlRecord::new(key.as_str(), item.original_url.as_str(), user_id.as_str()),
                    )
                })
                .collect();

            let outcome = match self.storage.store_batch(records).await {
                Ok(outcome) => outcome,
                Err(StorageError::DuplicateKey(key)) => {
                    debug!(short_key = %key, "batch key taken concurrently, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            if outcome.has_conflicts() {
                let conflicts = items
                    .iter()
                    .filter_map(|item| {
                        outcome
                            .conflicts
                            .get(&item.correlation_id)
                            .map(|existing| BatchResultItem {
                                correlation_id: item.correlation_id.clone(),
                                short_url: short_url(&self.base_url, &existing.short_key),
                            })
                    })
                    .collect();
                return Ok(BatchShortened {
                    conflict: true,
                    items: conflicts,
                });
            }

            let created = items
                .iter()
                .zip(&keys)
                .map(|(item, key)| BatchResultItem {
                    correlation_id: item.correlation_id.clone(),
                    short_url: short_url(&self.base_url, key),
                })
                .collect();
            return Ok(BatchShortened {
                conflict: false,
                items: created,
            });
        }

        warn!(attempts = self.max_key_attempts, "could not find free keys for batch");
        Err(ShortenerError::KeySpaceExhausted(self.max_key_attempts))
    }

    /// Draws `count` distinct free keys.
    async fn free_keys(&self, count: usize) -> Result<Option<Vec<String>>, ShortenerError> {
        let mut keys = Vec::with_capacity(count);
        let mut seen = HashSet::with_capacity(count);

        for _ in 0..count * self.max_key_attempts {
            if keys.len() == count {
                break;
            }
            let Some(key) = self.free_key().await? else {
                return Ok(None);
            };
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        Ok((keys.len() == count).then_some(keys))
    }

    pub async fn resolve(&self, short_key: &str) -> Result<Resolution, ShortenerError> {
        let resolution = match self.storage.load(short_key).await? {
            None => Resolution::NotFound,
            Some(record) if record.is_deleted => Resolution::Gone,
            Some(record) => Resolution::Redirect(record.original_url),
        };
        Ok(resolution)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ListedUrl>, ShortenerError> {
        Self::require_user(user_id)?;

        let records = self.storage.list(user_id).await?;
        Ok(records
            .into_iter()
            .map(|record| ListedUrl {
                short_url: short_url(&self.base_url, &record.short_key),
                original_url: record.original_url,
            })
            .collect())
    }

    /// Schedules tombstones for `short_keys` owned by `user_id`.
    ///
    /// Returning `Ok` means the request was accepted, not that it was applied.
    pub async fn delete(
        &self,
        user_id: &str,
        short_keys: Vec<String>,
    ) -> Result<(), ShortenerError> {
        Self::require_user(user_id)?;
        if short_keys.is_empty() {
            return Err(ShortenerError::EmptyDeleteRequest);
        }

        let requests = short_keys
            .into_iter()
            .map(|key| DeleteRequest::new(key, user_id))
            .collect();
        self.storage.delete(requests).await?;
        Ok(())
    }
}
