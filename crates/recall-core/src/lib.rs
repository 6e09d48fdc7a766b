//! Recall core: append-only memory log with a rebuildable semantic index
//!
//! - `log` - Date-partitioned JSON-lines log with stable line addresses
//! - `index` - Embeddings, sqlite-vec store, change detection, file watcher
//! - `service` - Store/search boundary with background indexing
//! - `config` - TOML configuration with environment overrides

pub mod config;
pub mod error;
pub mod index;
pub mod log;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use config::RecallConfig;
pub use error::{RecallError, Result};
pub use index::{
    Embedder, FastEmbedder, IndexHit, IndexStore, ReindexOutcome, Reindexer, SweepReport, Watcher,
    WatcherState,
};
pub use log::{EventLog, LogAddress, MemoryRecord};
pub use service::{MemoryService, SearchResult, ServiceResponse};
