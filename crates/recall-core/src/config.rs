//! Configuration
//!
//! Loaded from `~/.recall/config.toml` when present; every field has a
//! default. `RECALL_ROOT`, `RECALL_INDEX` and `RECALL_MODEL` override the
//! file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{RecallError, Result};
use crate::index::embeddings::{resolve_model, DEFAULT_MODEL};
use crate::index::store::DEFAULT_OVERFETCH_FACTOR;
use crate::log::layout::STORE_DIR_NAME;
use crate::service::DEFAULT_QUEUE_CAPACITY;

pub const ENV_ROOT: &str = "RECALL_ROOT";
pub const ENV_INDEX: &str = "RECALL_INDEX";
pub const ENV_MODEL: &str = "RECALL_MODEL";

const CONFIG_FILE: &str = "config.toml";
const INDEX_FILE: &str = "index.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    /// Directory holding `memories/<date>/memories.log`
    pub log_root: PathBuf,

    /// SQLite index file; defaults to `<log_root>/index.db`
    pub index_path: Option<PathBuf>,

    /// fastembed model name
    pub embedding_model: String,

    /// Vector length; derived from the model when unset
    pub embedding_dimension: Option<usize>,

    /// Quiet period before changed files are reindexed
    pub debounce_ms: u64,

    /// Workspace-filtered searches fetch `k * overfetch_factor` candidates
    pub overfetch_factor: usize,

    /// Pending background index jobs before new ones are dropped
    pub index_queue_capacity: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            log_root: default_config_dir().unwrap_or_else(|| PathBuf::from(STORE_DIR_NAME)),
            index_path: None,
            embedding_model: DEFAULT_MODEL.to_string(),
            embedding_dimension: None,
            debounce_ms: 2000,
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
            index_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

fn default_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(STORE_DIR_NAME))
}

impl RecallConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        default_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load from an explicit file, or the default location if it exists,
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            RecallError::Config(msg) => {
                RecallError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RecallError::Config(e.to_string()))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// `load`)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            self.log_root = PathBuf::from(root);
        }
        if let Some(index) = lookup(ENV_INDEX).filter(|v| !v.is_empty()) {
            self.index_path = Some(PathBuf::from(index));
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.embedding_model = model;
            self.embedding_dimension = None;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (_, model_dimension) = resolve_model(&self.embedding_model)?;
        if let Some(dimension) = self.embedding_dimension {
            if dimension != model_dimension {
                return Err(RecallError::Config(format!(
                    "embedding_dimension {} does not match model {} ({})",
                    dimension, self.embedding_model, model_dimension
                )));
            }
        }
        if self.debounce_ms == 0 {
            return Err(RecallError::Config("debounce_ms must be positive".into()));
        }
        if self.overfetch_factor == 0 {
            return Err(RecallError::Config("overfetch_factor must be positive".into()));
        }
        if self.index_queue_capacity == 0 {
            return Err(RecallError::Config(
                "index_queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.log_root.join(INDEX_FILE))
    }

    /// Configured dimension, or the model's own
    pub fn embedding_dimension(&self) -> Result<usize> {
        match self.embedding_dimension {
            Some(dimension) => Ok(dimension),
            None => resolve_model(&self.embedding_model).map(|(_, dimension)| dimension),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
