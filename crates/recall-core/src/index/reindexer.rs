//! Re-synchronizes the index with log files
//!
//! A file is re-embedded wholesale when its fingerprint changed. The new
//! fingerprint is only written after every insert succeeded, so a failed
//! pass leaves the file marked stale and the next trigger retries it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::embeddings::Embedder;
use super::fingerprint::{fingerprint, needs_reindex};
use super::store::IndexStore;
use crate::error::{RecallError, Result};
use crate::log::{infer_workspace, AddressedRecord, EventLog, LogAddress, MemoryRecord};

/// What a reindex attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexOutcome {
    /// File disappeared before it could be read
    Missing,
    /// Fingerprint matched; index untouched
    Unchanged,
    /// Entries replaced with this many records
    Indexed { records: usize },
}

/// Totals for a sweep over many files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub indexed: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub failed: Vec<PathBuf>,
}

/// Something the watcher can hand changed files to
#[async_trait]
pub trait ReindexTarget: Send + Sync {
    async fn reindex_file(&self, path: &Path) -> Result<ReindexOutcome>;
}

pub struct Reindexer {
    log: Arc<EventLog>,
    index: Arc<IndexStore>,
    embedder: Arc<dyn Embedder>,
    /// Index writes happen one pass (or one record) at a time
    write_lock: Mutex<()>,
}

impl Reindexer {
    pub fn new(log: Arc<EventLog>, index: Arc<IndexStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            log,
            index,
            embedder,
            write_lock: Mutex::new(()),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Bring one file's index entries up to date
    pub async fn reindex_file(&self, path: &Path) -> Result<ReindexOutcome> {
        let _guard = self.write_lock.lock().await;

        let snapshot = match self.log.snapshot(path).await {
            Ok(snapshot) => snapshot,
            Err(RecallError::NotFound(_)) => {
                debug!(path = %path.display(), "Log file gone before reindex");
                return Ok(ReindexOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let record_count = snapshot.records.len();
        let stored = self.index.get_fingerprint(path)?;
        if !needs_reindex(&snapshot.content, record_count, stored.as_ref()) {
            debug!(path = %path.display(), "Log file unchanged, skipping");
            return Ok(ReindexOutcome::Unchanged);
        }

        if let Err(e) = self.replace_entries(path, &snapshot.records).await {
            warn!(
                path = %path.display(),
                error = %e,
                "Reindex failed, fingerprint left stale for retry"
            );
            return Err(e);
        }

        self.index
            .set_fingerprint(path, &fingerprint(&snapshot.content), record_count)?;

        info!(path = %path.display(), records = record_count, "Reindexed log file");
        Ok(ReindexOutcome::Indexed {
            records: record_count,
        })
    }

    async fn replace_entries(&self, path: &Path, records: &[AddressedRecord]) -> Result<()> {
        self.index.delete_by_file(path)?;
        if records.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = records.iter().map(|r| r.record.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != texts.len() {
            return Err(RecallError::Embedding(format!(
                "Embedder returned {} vectors for {} texts",
                embeddings.len(),
                texts.len()
            )));
        }

        let fallback = infer_workspace(path).unwrap_or_default();
        for (entry, embedding) in records.iter().zip(&embeddings) {
            let workspace = workspace_of(&entry.record).unwrap_or(fallback.as_str());
            self.index
                .insert(embedding, workspace, path, entry.address.line_number)?;
        }
        Ok(())
    }

    /// Index a single freshly appended record.
    ///
    /// Replaces any entry already at that address, so racing with a
    /// whole-file pass can never leave a duplicate. The fingerprint is left
    /// alone; the next pass over the file still sees it as changed.
    pub async fn index_record(&self, address: &LogAddress, record: &MemoryRecord) -> Result<()> {
        let embedding = self.embedder.embed(&record.content).await?;

        let _guard = self.write_lock.lock().await;
        let fallback = infer_workspace(&address.file_path).unwrap_or_default();
        let workspace = workspace_of(record).unwrap_or(fallback.as_str());

        self.index
            .delete_by_address(&address.file_path, address.line_number)?;
        self.index
            .insert(&embedding, workspace, &address.file_path, address.line_number)?;

        debug!(
            path = %address.file_path.display(),
            line = address.line_number,
            "Indexed record"
        );
        Ok(())
    }

    /// Reindex every file, containing per-file failures
    pub async fn reindex_all(&self, files: &[PathBuf]) -> SweepReport {
        let mut report = SweepReport::default();
        for path in files {
            match self.reindex_file(path).await {
                Ok(ReindexOutcome::Indexed { .. }) => report.indexed += 1,
                Ok(ReindexOutcome::Unchanged) => report.unchanged += 1,
                Ok(ReindexOutcome::Missing) => report.missing += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to reindex log file");
                    report.failed.push(path.clone());
                }
            }
        }
        report
    }
}

#[async_trait]
impl ReindexTarget for Reindexer {
    async fn reindex_file(&self, path: &Path) -> Result<ReindexOutcome> {
        Reindexer::reindex_file(self, path).await
    }
}

fn workspace_of(record: &MemoryRecord) -> Option<&str> {
    record.workspace.as_deref().filter(|ws| !ws.is_empty())
}
