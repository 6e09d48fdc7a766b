//! Store/search boundary
//!
//! `store` succeeds once the record is durably appended; indexing happens in
//! the background. Failures come back as a `ServiceResponse` with `is_error`
//! set. Calling into an index that was never initialized is a bug and is
//! returned as an error instead.

mod cleanup;
mod worker;

pub use cleanup::prune_missing_workspaces;

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::RecallConfig;
use crate::error::{RecallError, Result};
use crate::index::{Embedder, FastEmbedder, IndexStore, Reindexer, SweepReport, Watcher};
use crate::log::{EventLog, MemoryRecord};
use worker::{spawn_index_worker, IndexJob};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Result of a store or search call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceResponse {
    /// JSON payload, or an error message when `is_error` is set
    pub output: String,
    pub is_error: bool,
}

impl ServiceResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: json!({ "error": message.into() }).to_string(),
            is_error: true,
        }
    }
}

/// A search hit resolved back to its record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub record: MemoryRecord,
    pub file_path: PathBuf,
    pub line_number: usize,
    pub distance: f64,
}

pub struct MemoryService {
    log: Arc<EventLog>,
    index: Arc<IndexStore>,
    reindexer: Arc<Reindexer>,
    jobs: mpsc::Sender<IndexJob>,
}

impl MemoryService {
    /// Initialize the index and start the background index worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        log: Arc<EventLog>,
        index: Arc<IndexStore>,
        embedder: Arc<dyn Embedder>,
        queue_capacity: usize,
    ) -> Result<Self> {
        index.initialize()?;

        let reindexer = Arc::new(Reindexer::new(log.clone(), index.clone(), embedder));
        let (jobs, rx) = mpsc::channel(queue_capacity.max(1));
        spawn_index_worker(reindexer.clone(), rx);

        Ok(Self {
            log,
            index,
            reindexer,
            jobs,
        })
    }

    /// Build the production stack: fastembed model and on-disk index
    pub fn from_config(config: &RecallConfig) -> Result<Self> {
        let embedder = FastEmbedder::new(&config.embedding_model)?
            .with_cache_dir(config.log_root.join("models"));
        let index_path = config.index_path();
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let index = IndexStore::open(index_path, config.embedding_dimension()?)
            .with_overfetch_factor(config.overfetch_factor);

        Self::new(
            Arc::new(EventLog::new(&config.log_root)),
            Arc::new(index),
            Arc::new(embedder),
            config.index_queue_capacity,
        )
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    /// Watcher over this service's log root, feeding its reindexer
    pub fn watcher(&self, debounce: Duration) -> Watcher {
        Watcher::new(self.log.root(), self.reindexer.clone()).with_debounce(debounce)
    }

    /// Append a record and queue it for indexing
    pub async fn store(&self, record: MemoryRecord) -> Result<ServiceResponse> {
        let address = match self.log.append(&record).await {
            Ok(address) => address,
            Err(e) => return respond::<()>(Err(e)),
        };

        let output = json!({
            "file_path": address.file_path,
            "line_number": address.line_number,
        })
        .to_string();

        let job = IndexJob::Index {
            address: address.clone(),
            record,
        };
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!(
                path = %address.file_path.display(),
                line = address.line_number,
                "Index queue full, record will be indexed on the next reindex pass"
            ),
            Err(TrySendError::Closed(_)) => warn!("Index worker not running"),
        }

        Ok(ServiceResponse::success(output))
    }

    /// Semantic search, resolving hits back to full records
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        workspace: Option<&str>,
    ) -> Result<ServiceResponse> {
        respond(self.search_records(query, k, workspace).await)
    }

    pub async fn search_records(
        &self,
        query: &str,
        k: usize,
        workspace: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        if !self.index.is_initialized() {
            return Err(RecallError::NotInitialized);
        }
        let embedding = self.reindexer.embedder().embed(query).await?;
        let hits = self.index.search(&embedding, k, workspace)?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let record = match self.log.read_at(&hit.file_path, hit.line_number).await {
                Ok(Some(record)) => record,
                Ok(None) | Err(RecallError::NotFound(_)) => {
                    debug!(
                        path = %hit.file_path.display(),
                        line = hit.line_number,
                        "Index entry no longer resolves to a record"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            results.push(SearchResult {
                record,
                file_path: hit.file_path,
                line_number: hit.line_number,
                distance: hit.distance,
            });
        }
        Ok(results)
    }

    /// Wait until every record stored so far has been through the index worker
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(IndexJob::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Reindex every log file under the root
    pub async fn reindex_all(&self) -> SweepReport {
        let files = self.log.list_log_files();
        let report = self.reindexer.reindex_all(&files).await;
        info!(
            indexed = report.indexed,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "Reindex sweep finished"
        );
        report
    }

    /// Drop every index entry and fingerprint, then rebuild from the log
    pub async fn rebuild(&self) -> Result<SweepReport> {
        self.index.clear()?;
        Ok(self.reindex_all().await)
    }

    pub fn workspaces(&self) -> Result<BTreeSet<String>> {
        self.index.list_distinct_workspaces()
    }

    pub fn prune_missing_workspaces(&self) -> Result<BTreeSet<String>> {
        prune_missing_workspaces(&self.index)
    }
}

/// Fold a result into a response; only an uninitialized index escapes as `Err`
fn respond<T: Serialize>(result: Result<T>) -> Result<ServiceResponse> {
    match result {
        Ok(value) => Ok(ServiceResponse::success(serde_json::to_string(&value)?)),
        Err(RecallError::NotInitialized) => {
            error!("Memory index used before initialization");
            Err(RecallError::NotInitialized)
        }
        Err(e) => {
            warn!(error = %e, "Memory request failed");
            Ok(ServiceResponse::error(e.to_string()))
        }
    }
}
