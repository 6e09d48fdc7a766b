//! Debounced log directory watcher
//!
//! File-system events are collected into a pending set. Each new event pushes
//! a single deadline out by the debounce interval; when it expires the pending
//! files are reindexed one by one.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reindexer::{ReindexOutcome, ReindexTarget};
use crate::error::Result;
use crate::log::layout::{absolute_root, is_log_file, list_log_files, MEMORIES_DIR};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    PendingChanges,
    Reindexing,
}

struct Shared {
    state: Mutex<WatcherState>,
    pending: Mutex<HashSet<PathBuf>>,
}

impl Shared {
    fn set_state(&self, state: WatcherState) {
        *self.state.lock() = state;
    }
}

pub struct Watcher {
    root: PathBuf,
    target: Arc<dyn ReindexTarget>,
    debounce: Duration,
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<PathBuf>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PathBuf>>>,
    cancel: CancellationToken,
    subscription: Mutex<Option<RecommendedWatcher>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    pub fn new(root: impl Into<PathBuf>, target: Arc<dyn ReindexTarget>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            root: absolute_root(root),
            target,
            debounce: DEFAULT_DEBOUNCE,
            shared: Arc::new(Shared {
                state: Mutex::new(WatcherState::Idle),
                pending: Mutex::new(HashSet::new()),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            subscription: Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn state(&self) -> WatcherState {
        *self.shared.state.lock()
    }

    /// Sweep existing logs, then subscribe to changes and start the debounce loop.
    ///
    /// Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let Some(events_rx) = self.events_rx.lock().take() else {
            debug!("Watcher already started");
            return Ok(());
        };

        self.sweep().await;

        let memories = self.root.join(MEMORIES_DIR);
        tokio::fs::create_dir_all(&memories).await?;

        // Events may name the directory by its resolved path; translate them
        // back so the index sees the same spelling the log hands out.
        let resolved = tokio::fs::canonicalize(&memories).await?;
        let watched = memories.clone();
        let tx = self.events_tx.clone();
        let mut subscription = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let path = rebase_event_path(path, &resolved, &watched);
                            if is_log_file(&path) {
                                let _ = tx.send(path);
                            }
                        }
                    }
                }
                Err(e) => warn!("File watch error: {}", e),
            },
            notify::Config::default(),
        )?;
        subscription.watch(&memories, RecursiveMode::Recursive)?;
        *self.subscription.lock() = Some(subscription);

        let handle = tokio::spawn(debounce_loop(
            self.shared.clone(),
            self.target.clone(),
            self.debounce,
            events_rx,
            self.cancel.child_token(),
        ));
        *self.task.lock().await = Some(handle);

        info!(root = %self.root.display(), "Watching memory logs");
        Ok(())
    }

    /// Queue a changed file as if the file system had reported it
    pub fn notify_changed(&self, path: impl Into<PathBuf>) {
        let _ = self.events_tx.send(path.into());
    }

    /// Unsubscribe and stop the loop. A pending deadline never fires; a pass
    /// already running finishes first.
    pub async fn stop(&self) {
        self.subscription.lock().take();
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Watcher loop ended abnormally: {}", e);
            }
        }
        self.shared.pending.lock().clear();
        self.shared.set_state(WatcherState::Idle);
        debug!(root = %self.root.display(), "Watcher stopped");
    }

    async fn sweep(&self) {
        let files = list_log_files(&self.root);
        if files.is_empty() {
            return;
        }
        self.shared.set_state(WatcherState::Reindexing);
        info!(files = files.len(), "Startup sweep");
        reindex_each(self.target.as_ref(), &files).await;
        self.shared.set_state(WatcherState::Idle);
    }
}

/// Re-root an event path reported under `resolved` onto `watched`
fn rebase_event_path(path: PathBuf, resolved: &Path, watched: &Path) -> PathBuf {
    match path.strip_prefix(resolved) {
        Ok(rest) => watched.join(rest),
        Err(_) => path,
    }
}

async fn debounce_loop(
    shared: Arc<Shared>,
    target: Arc<dyn ReindexTarget>,
    debounce: Duration,
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep_until = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(path) = event else { break };
                shared.pending.lock().insert(path);
                shared.set_state(WatcherState::PendingChanges);
                deadline = Some(Instant::now() + debounce);
            }
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                deadline = None;
                let files: Vec<PathBuf> = std::mem::take(&mut *shared.pending.lock())
                    .into_iter()
                    .collect();
                if files.is_empty() {
                    shared.set_state(WatcherState::Idle);
                    continue;
                }
                shared.set_state(WatcherState::Reindexing);
                reindex_each(target.as_ref(), &files).await;
                let next = if shared.pending.lock().is_empty() {
                    WatcherState::Idle
                } else {
                    WatcherState::PendingChanges
                };
                shared.set_state(next);
            }
        }
    }
}

async fn reindex_each(target: &dyn ReindexTarget, files: &[PathBuf]) {
    for path in files {
        match target.reindex_file(path).await {
            Ok(ReindexOutcome::Indexed { records }) => {
                debug!(path = %path.display(), records, "Reindexed after change")
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Reindex after change failed"),
        }
    }
}
