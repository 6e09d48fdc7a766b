//! Background indexing of freshly stored records
//!
//! A single worker drains a bounded queue, so at most one store-triggered
//! index write is in flight at a time.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::index::Reindexer;
use crate::log::{LogAddress, MemoryRecord};

pub(crate) enum IndexJob {
    Index {
        address: LogAddress,
        record: MemoryRecord,
    },
    /// Acknowledged once every job queued before it has been handled
    Flush(oneshot::Sender<()>),
}

pub(crate) fn spawn_index_worker(
    reindexer: Arc<Reindexer>,
    mut jobs: mpsc::Receiver<IndexJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            match job {
                IndexJob::Index { address, record } => {
                    // The record is already durable; a failure here only
                    // delays searchability until the watcher's next pass.
                    if let Err(e) = reindexer.index_record(&address, &record).await {
                        warn!(
                            path = %address.file_path.display(),
                            line = address.line_number,
                            error = %e,
                            "Background indexing failed"
                        );
                    }
                }
                IndexJob::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Index worker stopped");
    })
}
