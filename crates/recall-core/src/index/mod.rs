//! Semantic index over the memory log
//!
//! The index is derived data: it can be deleted at any time and a sweep over
//! the log rebuilds it exactly.
//!
//! Key components:
//! - `embeddings` - Text embedding via fastembed (bge-small-en-v1.5 by default)
//! - `fingerprint` - Content hashes that decide when a file needs reindexing
//! - `store` - SQLite + sqlite-vec vector store
//! - `reindexer` - Replaces a file's entries when its content changed
//! - `watcher` - Debounced file-system watcher driving the reindexer

pub mod embeddings;
pub mod fingerprint;
pub mod reindexer;
pub mod store;
pub mod watcher;

pub use embeddings::{Embedder, FastEmbedder};
pub use fingerprint::{fingerprint, needs_reindex, FileFingerprint};
pub use reindexer::{ReindexOutcome, ReindexTarget, Reindexer, SweepReport};
pub use store::{IndexHit, IndexStore};
pub use watcher::{Watcher, WatcherState};
