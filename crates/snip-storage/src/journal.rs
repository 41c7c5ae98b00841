//! Log-backed storage engine.
//!
//! Records live in an in-process map. When a journal path is configured,
//! every mutation is appended to a newline-delimited JSON file before it is
//! applied in memory:
//!
//! ```text
//! {"uuid":1,"short_key":"aB3xY9","original_url":"https://a.example","user_id":"u1","is_deleted":false}
//! {"uuid":2,"short_key":"aB3xY9","original_url":"https://a.example","user_id":"u1","is_deleted":true}
//! ```
//!
//! On open the file is replayed in order and the last line for a key wins,
//! so tombstones survive restarts. When two live lines claim the same URL
//! under different keys, the later one wins and the earlier record is
//! treated as tombstoned.
//!
//! File writes and fsyncs run on the blocking thread pool while the state
//! lock is held, so async workers never wait on disk.

use crate::delete::{DeletePipeline, DeletePipelineConfig, TombstoneSink};
use crate::validate;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snip_core::{
    BatchOutcome, DeleteRequest, Result, Storage, StorageError, StoreOutcome, UrlRecord,
};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, TypedBuilder)]
pub struct JournalConfig {
    /// Path of the journal file; created if missing.
    #[builder(setter(into))]
    path: PathBuf,
    /// Whether every append is followed by an fsync.
    #[builder(default = true)]
    sync: bool,
}

/// Diagnostic statistics from a journal replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Number of lines applied to the map.
    pub applied: usize,
    /// Number of lines that could not be decoded and were skipped.
    pub skipped: usize,
    /// Live records tombstoned because a later line took their URL.
    pub superseded: usize,
    /// Highest sequence number seen.
    pub last_seq: u64,
}

#[derive(Serialize)]
struct JournalLine<'a> {
    #[serde(rename = "uuid")]
    seq: u64,
    #[serde(flatten)]
    record: &'a UrlRecord,
}

#[derive(Deserialize)]
struct JournalEntry {
    #[serde(rename = "uuid", default)]
    seq: u64,
    #[serde(flatten)]
    record: UrlRecord,
}

struct Journal {
    file: File,
    next_seq: u64,
    sync: bool,
    /// Set when a failed append could not be rolled back; every later
    /// append is refused so the torn bytes never get followed by valid lines.
    poisoned: bool,
}

impl Journal {
    /// Appends all records as one write. On failure the file is truncated
    /// back to its previous length, so either every line lands or none does.
    fn append_all(&mut self, records: &[UrlRecord]) -> Result<()> {
        if self.poisoned {
            return Err(StorageError::Io(
                "journal is unusable after a failed rollback".to_string(),
            ));
        }

        let mut data = Vec::new();
        for (offset, record) in records.iter().enumerate() {
            let line = JournalLine {
                seq: self.next_seq + offset as u64,
                record,
            };
            serde_json::to_writer(&mut data, &line).map_err(|e| {
                StorageError::InvalidData(format!("cannot encode journal line: {e}"))
            })?;
            data.push(b'\n');
        }

        let start = self.file.metadata()?.len();
        if let Err(err) = self.write_and_sync(&data) {
            match self.file.set_len(start) {
                Ok(()) => warn!(error = %err, len = start, "journal append rolled back"),
                Err(rollback) => {
                    error!(error = %err, rollback = %rollback, "journal rollback failed, refusing further writes");
                    self.poisoned = true;
                }
            }
            return Err(err.into());
        }

        self.next_seq += records.len() as u64;
        Ok(())
    }

    fn write_and_sync(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct State {
    records: HashMap<String, UrlRecord>,
    /// original URL -> short key, for live records only.
    live_urls: HashMap<String, String>,
    journal: Option<Journal>,
}

impl State {
    fn live_by_url(&self, original_url: &str) -> Option<&UrlRecord> {
        self.live_urls
            .get(original_url)
            .and_then(|key| self.records.get(key))
    }

    /// Replaces whatever is stored under the record's key.
    ///
    /// Returns the key of a different live record that held the same URL;
    /// that record is tombstoned in memory. Only replay of a journal written
    /// without deduplication can get here.
    fn apply(&mut self, record: UrlRecord) -> Option<String> {
        if let Some(previous) = self.records.get(&record.short_key) {
            if self.live_urls.get(&previous.original_url) == Some(&previous.short_key) {
                self.live_urls.remove(&previous.original_url);
            }
        }

        let mut superseded = None;
        if record.is_live() {
            let other = self
                .live_urls
                .insert(record.original_url.clone(), record.short_key.clone())
                .filter(|other| *other != record.short_key);
            if let Some(other) = other {
                if let Some(older) = self.records.get_mut(&other) {
                    older.is_deleted = true;
                    superseded = Some(other);
                }
            }
        }
        self.records.insert(record.short_key.clone(), record);
        superseded
    }

    /// Journals the records, then applies them. Nothing changes in memory
    /// when the append fails.
    fn persist(&mut self, records: Vec<UrlRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(journal) = self.journal.as_mut() {
            journal.append_all(&records).inspect_err(|err| {
                error!(error = %err, count = records.len(), "journal append failed");
            })?;
        }
        for record in records {
            self.apply(record);
        }
        Ok(())
    }

    fn store(&mut self, record: UrlRecord) -> Result<StoreOutcome> {
        if let Some(existing) = self.live_by_url(&record.original_url) {
            return Ok(StoreOutcome::Conflict(existing.clone()));
        }
        if self.records.contains_key(&record.short_key) {
            return Err(StorageError::DuplicateKey(record.short_key));
        }

        self.persist(vec![record])?;
        Ok(StoreOutcome::Created)
    }

    fn store_batch(&mut self, records: Vec<(String, UrlRecord)>) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut accepted: Vec<&UrlRecord> = Vec::with_capacity(records.len());
        let mut batch_urls: HashMap<&str, usize> = HashMap::new();
        let mut batch_keys: HashSet<&str> = HashSet::new();

        // plan first so a key collision leaves the store untouched
        for (correlation_id, record) in &records {
            let earlier = batch_urls
                .get(record.original_url.as_str())
                .map(|&index| accepted[index]);
            if let Some(existing) = self.live_by_url(&record.original_url).or(earlier) {
                outcome
                    .conflicts
                    .insert(correlation_id.clone(), existing.clone());
                break;
            }

            if self.records.contains_key(&record.short_key)
                || !batch_keys.insert(record.short_key.as_str())
            {
                return Err(StorageError::DuplicateKey(record.short_key.clone()));
            }

            batch_urls.insert(record.original_url.as_str(), accepted.len());
            accepted.push(record);
        }

        let accepted: Vec<UrlRecord> = accepted.into_iter().cloned().collect();
        self.persist(accepted)?;
        Ok(outcome)
    }

    fn tombstone(&mut self, batch: Vec<DeleteRequest>) -> Result<u64> {
        let mut seen = HashSet::new();
        let mut tombstones = Vec::new();

        for request in &batch {
            let Some(record) = self.records.get(&request.short_key) else {
                continue;
            };
            if !record.is_owned_by(request) || record.is_deleted {
                continue;
            }
            if seen.insert(record.short_key.clone()) {
                tombstones.push(UrlRecord {
                    is_deleted: true,
                    ..record.clone()
                });
            }
        }

        let count = tombstones.len() as u64;
        self.persist(tombstones)?;
        Ok(count)
    }
}

/// Runs `op` under the write lock on the blocking thread pool.
async fn with_state<T, F>(state: &Arc<RwLock<State>>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut State) -> Result<T> + Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || op(&mut state.write()))
        .await
        .map_err(|e| StorageError::Unavailable(format!("journal task failed: {e}")))?
}

struct JournalSink {
    state: Arc<RwLock<State>>,
}

#[async_trait]
impl TombstoneSink for JournalSink {
    async fn apply(&self, batch: Vec<DeleteRequest>) -> Result<u64> {
        with_state(&self.state, move |state| state.tombstone(batch)).await
    }
}

/// In-memory storage with an optional append-only journal.
///
/// A single lock guards the map, the URL index and the journal file, so
/// the duplicate check and the insert that follows it are atomic.
pub struct JournalStorage {
    state: Arc<RwLock<State>>,
    pipeline: DeletePipeline<JournalSink>,
    replay: ReplayStats,
}

impl JournalStorage {
    /// Creates a purely in-memory engine; nothing survives the process.
    pub fn in_memory() -> Self {
        Self::from_state(State::default(), ReplayStats::default())
    }

    /// Opens (or creates) the journal at the configured path and replays it.
    pub fn open(config: JournalConfig) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&config.path)
            .map_err(|e| {
                StorageError::Initialization(format!(
                    "cannot open journal {}: {e}",
                    config.path.display()
                ))
            })?;

        let mut state = State::default();
        let (stats, needs_newline) = replay(&file, &config.path, &mut state)?;

        if needs_newline {
            // terminate a torn last line so the next append starts clean
            file.write_all(b"\n")?;
        }

        info!(
            path = %config.path.display(),
            applied = stats.applied,
            skipped = stats.skipped,
            superseded = stats.superseded,
            records = state.records.len(),
            "journal replayed"
        );

        state.journal = Some(Journal {
            file,
            next_seq: stats.last_seq + 1,
            sync: config.sync,
            poisoned: false,
        });

        Ok(Self::from_state(state, stats))
    }

    fn from_state(state: State, replay: ReplayStats) -> Self {
        let state = Arc::new(RwLock::new(state));
        let sink = JournalSink {
            state: Arc::clone(&state),
        };
        // tombstones are relayed one at a time through a single worker
        let pipeline =
            DeletePipeline::new(Arc::new(sink), DeletePipelineConfig::builder().workers(1).build());

        Self {
            state,
            pipeline,
            replay,
        }
    }

    /// Statistics of the replay performed by [`JournalStorage::open`].
    pub fn replay_stats(&self) -> ReplayStats {
        self.replay
    }

    pub fn is_persistent(&self) -> bool {
        self.state.read().journal.is_some()
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Waits for every scheduled deletion to be applied.
    pub async fn shutdown(&self) {
        self.pipeline.drain().await;
    }
}

fn replay(file: &File, path: &Path, state: &mut State) -> Result<(ReplayStats, bool)> {
    let mut reader = BufReader::new(file);
    let mut stats = ReplayStats::default();
    let mut line = Vec::new();
    let mut needs_newline = false;
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line).map_err(|e| {
            StorageError::Initialization(format!("cannot read journal {}: {e}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        line_no += 1;
        needs_newline = line.last() != Some(&b'\n');

        let content = line.trim_ascii();
        if content.is_empty() {
            continue;
        }

        match serde_json::from_slice::<JournalEntry>(content) {
            Ok(entry) => {
                stats.last_seq = stats.last_seq.max(entry.seq);
                stats.applied += 1;
                if let Some(older) = state.apply(entry.record) {
                    warn!(line = line_no, short_key = %older, "live record superseded by a later line for the same url");
                    stats.superseded += 1;
                }
            }
            Err(err) => {
                warn!(line = line_no, error = %err, "skipping undecodable journal line");
                stats.skipped += 1;
            }
        }
    }

    Ok((stats, needs_newline))
}

#[async_trait]
impl Storage for JournalStorage {
    async fn load(&self, short_key: &str) -> Result<Option<UrlRecord>> {
        Ok(self.state.read().records.get(short_key).cloned())
    }

    async fn store(&self, record: UrlRecord) -> Result<StoreOutcome> {
        validate(&record)?;
        with_state(&self.state, move |state| state.store(record)).await
    }

    async fn store_batch(&self, records: Vec<(String, UrlRecord)>) -> Result<BatchOutcome> {
        for (_, record) in &records {
            validate(record)?;
        }
        with_state(&self.state, move |state| state.store_batch(records)).await
    }

    async fn list(&self, user_id: &str) -> Result<Vec<UrlRecord>> {
        Ok(self
            .state
            .read()
            .records
            .values()
            .filter(|record| record.user_id == user_id && record.is_live())
            .cloned()
            .collect())
    }

    async fn delete(&self, requests: Vec<DeleteRequest>) -> Result<()> {
        debug!(count = requests.len(), "scheduling tombstones");
        drop(self.pipeline.submit(requests));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn record(key: &str, url: &str, user: &str) -> UrlRecord {
        UrlRecord::new(key, url, user)
    }

    fn journal_config(dir: &TempDir) -> JournalConfig {
        JournalConfig::builder()
            .path(dir.path().join("urls.json"))
            .build()
    }

    async fn wait_until_deleted(storage: &JournalStorage, key: &str) {
        awaitility::at_most(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async {
                storage
                    .load(key)
                    .await
                    .unwrap()
                    .is_some_and(|record| record.is_deleted)
            })
            .await;
    }

    #[tokio::test]
    async fn store_and_load() {
        let storage = JournalStorage::in_memory();

        let outcome = storage
            .store(record("abc123", "https://a.example", "alice"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Created);

        let loaded = storage.load("abc123").await.unwrap().unwrap();
        assert_eq!(loaded.original_url, "https://a.example");
        assert!(loaded.is_live());
        assert!(!storage.is_persistent());
    }

    #[tokio::test]
    async fn load_unknown_key() {
        let storage = JournalStorage::in_memory();

        assert!(storage.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_url_returns_existing_record() {
        let storage = JournalStorage::in_memory();

        storage
            .store(record("first1", "https://a.example", "alice"))
            .await
            .unwrap();
        let outcome = storage
            .store(record("second", "https://a.example", "bob"))
            .await
            .unwrap();

        let StoreOutcome::Conflict(existing) = outcome else {
            panic!("expected a conflict, got {outcome:?}");
        };
        assert_eq!(existing.short_key, "first1");
        assert!(storage.load("second").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn taken_key_is_rejected() {
        let storage = JournalStorage::in_memory();

        storage
            .store(record("abc123", "https://a.example", "alice"))
            .await
            .unwrap();
        let err = storage
            .store(record("abc123", "https://b.example", "alice"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::DuplicateKey(key) if key == "abc123"));
        let kept = storage.load("abc123").await.unwrap().unwrap();
        assert_eq!(kept.original_url, "https://a.example");
    }

    #[tokio::test]
    async fn empty_fields_never_reach_the_map() {
        let storage = JournalStorage::in_memory();

        let err = storage
            .store(record("", "https://a.example", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));

        let err = storage.store(record("abc123", "", "alice")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn batch_without_conflicts_stores_everything() {
        let storage = JournalStorage::in_memory();

        let outcome = storage
            .store_batch(vec![
                ("1".to_string(), record("key001", "https://a.example", "alice")),
                ("2".to_string(), record("key002", "https://b.example", "alice")),
            ])
            .await
            .unwrap();

        assert!(!outcome.has_conflicts());
        assert!(storage.load("key001").await.unwrap().is_some());
        assert!(storage.load("key002").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn batch_stops_at_first_conflict() {
        let storage = JournalStorage::in_memory();
        storage
            .store(record("exists", "https://b.example", "alice"))
            .await
            .unwrap();

        let outcome = storage
            .store_batch(vec![
                ("1".to_string(), record("key001", "https://a.example", "alice")),
                ("2".to_string(), record("key002", "https://b.example", "alice")),
                ("3".to_string(), record("key003", "https://c.example", "alice")),
            ])
            .await
            .unwrap();

        assert!(outcome.has_conflicts());
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts["2"].short_key, "exists");
        // items before the conflict are kept, items after it were never attempted
        assert!(storage.load("key001").await.unwrap().is_some());
        assert!(storage.load("key002").await.unwrap().is_none());
        assert!(storage.load("key003").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_detects_duplicates_within_itself() {
        let storage = JournalStorage::in_memory();

        let outcome = storage
            .store_batch(vec![
                ("1".to_string(), record("key001", "https://a.example", "alice")),
                ("2".to_string(), record("key002", "https://a.example", "alice")),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.conflicts["2"].short_key, "key001");
        assert!(storage.load("key001").await.unwrap().is_some());
        assert!(storage.load("key002").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_key_collision_persists_nothing() {
        let storage = JournalStorage::in_memory();
        storage
            .store(record("taken1", "https://z.example", "alice"))
            .await
            .unwrap();

        let err = storage
            .store_batch(vec![
                ("1".to_string(), record("key001", "https://a.example", "alice")),
                ("2".to_string(), record("taken1", "https://b.example", "alice")),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::DuplicateKey(_)));
        assert!(storage.load("key001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_partitioned_by_user() {
        let storage = JournalStorage::in_memory();
        storage
            .store(record("alice1", "https://a.example", "alice"))
            .await
            .unwrap();
        storage
            .store(record("alice2", "https://b.example", "alice"))
            .await
            .unwrap();
        storage
            .store(record("bob001", "https://c.example", "bob"))
            .await
            .unwrap();

        let mut keys: Vec<String> = storage
            .list("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.short_key)
            .collect();
        keys.sort();

        assert_eq!(keys, vec!["alice1", "alice2"]);
        assert!(storage.list("carol").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_tombstones_eventually() {
        let storage = JournalStorage::in_memory();
        storage
            .store(record("abc123", "https://a.example", "alice"))
            .await
            .unwrap();

        storage
            .delete(vec![DeleteRequest::new("abc123", "alice")])
            .await
            .unwrap();
        wait_until_deleted(&storage, "abc123").await;

        assert!(storage.list("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_by_other_user_is_ignored() {
        let storage = JournalStorage::in_memory();
        storage
            .store(record("abc123", "https://a.example", "alice"))
            .await
            .unwrap();

        storage
            .delete(vec![
                DeleteRequest::new("abc123", "mallory"),
                DeleteRequest::new("missing", "alice"),
            ])
            .await
            .unwrap();
        storage.shutdown().await;

        assert!(storage.load("abc123").await.unwrap().unwrap().is_live());
    }

    #[tokio::test]
    async fn deleted_url_can_be_shortened_again() {
        let storage = JournalStorage::in_memory();
        storage
            .store(record("old123", "https://a.example", "alice"))
            .await
            .unwrap();
        storage
            .delete(vec![DeleteRequest::new("old123", "alice")])
            .await
            .unwrap();
        storage.shutdown().await;

        let outcome = storage
            .store(record("new123", "https://a.example", "alice"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Created);

        // the tombstoned key stays reserved
        let err = storage
            .store(record("old123", "https://b.example", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn journal_survives_restart() {
        let dir = TempDir::new().unwrap();

        {
            let storage = JournalStorage::open(journal_config(&dir)).unwrap();
            assert!(storage.is_persistent());
            storage
                .store(record("abc123", "https://a.example", "alice"))
                .await
                .unwrap();
            storage
                .store(record("def456", "https://b.example", "bob"))
                .await
                .unwrap();
            storage
                .delete(vec![DeleteRequest::new("def456", "bob")])
                .await
                .unwrap();
            storage.shutdown().await;
        }

        let storage = JournalStorage::open(journal_config(&dir)).unwrap();
        let stats = storage.replay_stats();
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.last_seq, 3);

        let alive = storage.load("abc123").await.unwrap().unwrap();
        assert_eq!(alive.original_url, "https://a.example");
        assert!(alive.is_live());
        assert!(storage.load("def456").await.unwrap().unwrap().is_deleted);

        // dedup index is rebuilt from the replay
        let outcome = storage
            .store(record("zzz999", "https://a.example", "carol"))
            .await
            .unwrap();
        assert!(outcome.is_conflict());
    }

    #[tokio::test]
    async fn replay_keeps_last_line_per_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"uuid":1,"short_key":"abc123","original_url":"https://old.example","user_id":"alice"}"#,
                "\n",
                r#"{"uuid":2,"short_key":"abc123","original_url":"https://new.example","user_id":"alice"}"#,
                "\n",
            ),
        )
        .unwrap();

        let storage = JournalStorage::open(JournalConfig::builder().path(&path).build()).unwrap();

        let loaded = storage.load("abc123").await.unwrap().unwrap();
        assert_eq!(loaded.original_url, "https://new.example");
        // the superseded URL is free again
        let outcome = storage
            .store(record("xyz789", "https://old.example", "alice"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Created);
    }

    #[tokio::test]
    async fn replay_skips_garbage_and_repairs_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"uuid":1,"short_key":"abc123","original_url":"https://a.example","user_id":"alice"}"#,
                "\n",
                "not json\n",
                r#"{"uuid":2,"short_key":"def4"#,
            ),
        )
        .unwrap();

        {
            let storage =
                JournalStorage::open(JournalConfig::builder().path(&path).build()).unwrap();
            let stats = storage.replay_stats();
            assert_eq!(stats.applied, 1);
            assert_eq!(stats.skipped, 2);

            storage
                .store(record("ghi789", "https://c.example", "alice"))
                .await
                .unwrap();
        }

        let storage = JournalStorage::open(JournalConfig::builder().path(&path).build()).unwrap();
        assert_eq!(storage.replay_stats().applied, 2);
        assert!(storage.load("ghi789").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replay_tombstones_earlier_live_record_with_same_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"uuid":1,"short_key":"k1","original_url":"https://dup.example","user_id":"alice","DeletedFlag":false}"#,
                "\n",
                r#"{"uuid":2,"short_key":"k2","original_url":"https://dup.example","user_id":"alice","DeletedFlag":false}"#,
                "\n",
            ),
        )
        .unwrap();

        let storage = JournalStorage::open(JournalConfig::builder().path(&path).build()).unwrap();
        assert_eq!(storage.replay_stats().superseded, 1);
        assert!(storage.load("k1").await.unwrap().unwrap().is_deleted);

        let live: Vec<String> = storage
            .list("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.short_key)
            .collect();
        assert_eq!(live, vec!["k2"]);

        storage
            .delete(vec![DeleteRequest::new("k2", "alice")])
            .await
            .unwrap();
        storage.shutdown().await;

        let outcome = storage
            .store(record("k3", "https://dup.example", "alice"))
            .await
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Created);

        let live: Vec<String> = storage
            .list("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.short_key)
            .collect();
        assert_eq!(live, vec!["k3"]);
    }

    #[tokio::test]
    async fn failed_append_leaves_no_trace_after_restart() {
        let dir = TempDir::new().unwrap();
        let storage = JournalStorage::open(journal_config(&dir)).unwrap();
        storage
            .store(record("before", "https://before.example", "alice"))
            .await
            .unwrap();

        let full = OpenOptions::new().write(true).open("/dev/full").unwrap();
        let original = {
            let mut state = storage.state.write();
            let journal = state.journal.as_mut().unwrap();
            std::mem::replace(&mut journal.file, full)
        };

        let err = storage
            .store(record("failed", "https://a.example", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(storage.load("failed").await.unwrap().is_none());

        let err = storage
            .store_batch(vec![
                ("1".to_string(), record("batch1", "https://b.example", "alice")),
                ("2".to_string(), record("batch2", "https://c.example", "alice")),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(storage.load("batch1").await.unwrap().is_none());

        storage.state.write().journal.as_mut().unwrap().file = original;
        // refused when the failed write could not be rolled back
        let _ = storage
            .store(record("retry1", "https://a.example", "alice"))
            .await;
        drop(storage);

        let reopened = JournalStorage::open(journal_config(&dir)).unwrap();
        assert_eq!(reopened.replay_stats().skipped, 0);
        assert!(reopened.load("before").await.unwrap().is_some());
        assert!(reopened.load("failed").await.unwrap().is_none());
        assert!(reopened.load("batch1").await.unwrap().is_none());
        assert!(reopened.load("batch2").await.unwrap().is_none());

        let live_for_url = reopened
            .list("alice")
            .await
            .unwrap()
            .into_iter()
            .filter(|record| record.original_url == "https://a.example")
            .count();
        assert!(live_for_url <= 1);
    }

    #[test]
    fn poisoned_journal_refuses_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(&path, "{}\n").unwrap();
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let mut journal = Journal {
            file,
            next_seq: 1,
            sync: false,
            poisoned: false,
        };

        journal
            .append_all(&[record("k1", "https://a.example", "alice")])
            .unwrap();
        assert_eq!(journal.next_seq, 2);

        journal.poisoned = true;
        let err = journal
            .append_all(&[record("k2", "https://b.example", "alice")])
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(journal.next_seq, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains("k2"));
    }

    #[tokio::test]
    async fn unopenable_journal_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("urls.json");

        let err = JournalStorage::open(JournalConfig::builder().path(path).build())
            .err()
            .unwrap();

        assert!(matches!(err, StorageError::Initialization(_)));
    }

    #[tokio::test]
    async fn concurrent_stores_of_one_url_create_a_single_record() {
        let storage = Arc::new(JournalStorage::in_memory());
        let mut handles = vec![];

        for i in 0..16 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                storage
                    .store(record(&format!("key{i:03}"), "https://race.example", "alice"))
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        let mut winners = HashSet::new();
        for handle in handles {
            match handle.await.unwrap() {
                StoreOutcome::Created => created += 1,
                StoreOutcome::Conflict(existing) => {
                    winners.insert(existing.short_key);
                }
            }
        }

        assert_eq!(created, 1);
        assert!(winners.len() <= 1);
        assert_eq!(storage.list("alice").await.unwrap().len(), 1);
    }
}
