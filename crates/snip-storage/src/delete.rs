//! Asynchronous tombstone pipeline shared by the storage engines.
//!
//! ```text
//!  submit(requests)
//!        │
//!   [generator] ──► channel(1) ──┬─► worker 0 ─┐
//!                                ├─► worker 1 ─┼─► batches ──► [consumer] ──► TombstoneSink::apply
//!                                └─► worker N ─┘
//! ```
//!
//! Each worker accumulates the requests it drains into a local batch and
//! emits it when the input is exhausted (or when `max_batch_size` is hit).
//! The consumer applies batches one at a time. Failed batches are logged
//! and dropped; nothing is retried and nothing reaches the original caller.

use async_trait::async_trait;
use snip_core::{DeleteRequest, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};
use typed_builder::TypedBuilder;

pub const DEFAULT_DELETE_WORKERS: usize = 10;

/// Destination of completed tombstone batches.
#[async_trait]
pub trait TombstoneSink: Send + Sync + 'static {
    /// Applies one batch and returns how many records were tombstoned.
    ///
    /// Requests whose key or owner do not match a live record are skipped.
    async fn apply(&self, batch: Vec<DeleteRequest>) -> Result<u64>;
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct DeletePipelineConfig {
    /// Number of concurrent batching workers.
    #[builder(default = DEFAULT_DELETE_WORKERS)]
    workers: usize,
    /// Upper bound on a single batch; unbounded when unset.
    #[builder(default, setter(strip_option))]
    max_batch_size: Option<usize>,
}

impl DeletePipelineConfig {
    pub fn workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn max_batch_size(&self) -> Option<usize> {
        self.max_batch_size.filter(|size| *size > 0)
    }
}

impl Default for DeletePipelineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Summary of one submitted deletion, available through the handle
/// returned by [`DeletePipeline::submit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub requested: usize,
    pub batches: usize,
    pub tombstoned: u64,
    pub failed_batches: usize,
}

pub struct DeletePipeline<S> {
    sink: Arc<S>,
    config: DeletePipelineConfig,
    tracker: TaskTracker,
    /// Serializes `drain` so one caller cannot reopen the tracker while
    /// another is still waiting on it.
    draining: Mutex<()>,
}

impl<S: TombstoneSink> DeletePipeline<S> {
    pub fn new(sink: Arc<S>, config: DeletePipelineConfig) -> Self {
        Self {
            sink,
            config,
            tracker: TaskTracker::new(),
            draining: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DeletePipelineConfig {
        &self.config
    }

    /// Starts a pipeline run for `requests` and returns immediately.
    ///
    /// Must be called from within a tokio runtime. The returned handle
    /// resolves once every batch has been applied or has failed; dropping
    /// it does not cancel the work.
    pub fn submit(&self, requests: Vec<DeleteRequest>) -> JoinHandle<DeleteReport> {
        let requested = requests.len();
        if requested == 0 {
            return self.tracker.spawn(async { DeleteReport::default() });
        }

        let workers = self.config.workers();
        let max_batch_size = self.config.max_batch_size();

        let (request_tx, request_rx) = mpsc::channel::<DeleteRequest>(1);
        let request_rx = Arc::new(Mutex::new(request_rx));
        let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<DeleteRequest>>(workers);

        self.tracker.spawn(async move {
            for request in requests {
                if request_tx.send(request).await.is_err() {
                    break;
                }
            }
        });

        for worker in 0..workers {
            let request_rx = Arc::clone(&request_rx);
            let batch_tx = batch_tx.clone();
            self.tracker
                .spawn(collect_batches(worker, request_rx, batch_tx, max_batch_size));
        }
        drop(batch_tx);

        let sink = Arc::clone(&self.sink);
        self.tracker.spawn(async move {
            let mut report = DeleteReport {
                requested,
                ..DeleteReport::default()
            };

            while let Some(batch) = batch_rx.recv().await {
                report.batches += 1;
                let batch_size = batch.len();
                match sink.apply(batch).await {
                    Ok(tombstoned) => report.tombstoned += tombstoned,
                    Err(err) => {
                        report.failed_batches += 1;
                        error!(error = %err, batch_size, "failed to apply tombstone batch");
                    }
                }
            }

            debug!(
                requested = report.requested,
                batches = report.batches,
                tombstoned = report.tombstoned,
                failed_batches = report.failed_batches,
                "delete pipeline finished"
            );
            report
        })
    }

    /// Waits until every pipeline submitted so far has finished.
    pub async fn drain(&self) {
        let _guard = self.draining.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

async fn collect_batches(
    worker: usize,
    requests: Arc<Mutex<mpsc::Receiver<DeleteRequest>>>,
    batches: mpsc::Sender<Vec<DeleteRequest>>,
    max_batch_size: Option<usize>,
) {
    let mut batch = Vec::new();

    loop {
        let next = requests.lock().await.recv().await;
        let Some(request) = next else {
            break;
        };
        batch.push(request);

        if max_batch_size.is_some_and(|max| batch.len() >= max)
            && batches.send(std::mem::take(&mut batch)).await.is_err()
        {
            return;
        }
    }

    if !batch.is_empty() {
        debug!(worker, batch_size = batch.len(), "worker emitting batch");
        let _ = batches.send(batch).await;
    }
}
