//! Text embeddings
//!
//! The index only needs something that turns text into fixed-length vectors.
//! `FastEmbedder` is the local backend (fastembed, ONNX); the same embedder
//! must be used for indexing and querying or distances are meaningless.

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task;
use tracing::{debug, info};

use crate::error::{RecallError, Result};

/// Default model name used when none is configured
pub const DEFAULT_MODEL: &str = "bge-small-en-v1.5";

/// Anything that can embed text for the index
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Length of every vector this embedder produces
    fn dimension(&self) -> usize;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::Embedding("Empty embedding result".into()))
    }

    /// Embed many texts; output has the same length and order as the input
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Resolve a model name to a fastembed model and its dimension
pub fn resolve_model(name: &str) -> Result<(EmbeddingModel, usize)> {
    let resolved = match name {
        "bge-small-en-v1.5" | "BGESmallENV15" => (EmbeddingModel::BGESmallENV15, 384),
        "bge-base-en-v1.5" | "BGEBaseENV15" => (EmbeddingModel::BGEBaseENV15, 768),
        "bge-large-en-v1.5" | "BGELargeENV15" => (EmbeddingModel::BGELargeENV15, 1024),
        "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (EmbeddingModel::AllMiniLML6V2, 384),
        "all-MiniLM-L12-v2" | "AllMiniLML12V2" => (EmbeddingModel::AllMiniLML12V2, 384),
        "nomic-embed-text-v1.5" | "NomicEmbedTextV15" => (EmbeddingModel::NomicEmbedTextV15, 768),
        _ => {
            return Err(RecallError::Config(format!(
                "Unknown embedding model: '{}'. Supported: bge-small-en-v1.5, bge-base-en-v1.5, \
                 bge-large-en-v1.5, all-MiniLM-L6-v2, all-MiniLM-L12-v2, nomic-embed-text-v1.5",
                name
            )))
        }
    };
    Ok(resolved)
}

/// Local embeddings via fastembed, loaded on first use
pub struct FastEmbedder {
    model_name: EmbeddingModel,
    dimension: usize,
    cache_dir: Option<PathBuf>,
    model: OnceCell<Arc<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new(model: &str) -> Result<Self> {
        let (model_name, dimension) = resolve_model(model)?;
        Ok(Self {
            model_name,
            dimension,
            cache_dir: None,
            model: OnceCell::new(),
        })
    }

    /// Store downloaded model files somewhere other than the working directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    fn get_or_init_model(&self) -> Result<Arc<TextEmbedding>> {
        self.model
            .get_or_try_init(|| {
                info!(model = ?self.model_name, "Initializing embedding model");

                let mut options =
                    InitOptions::new(self.model_name.clone()).with_show_download_progress(false);
                if let Some(dir) = &self.cache_dir {
                    options = options.with_cache_dir(dir.clone());
                }
                let model = TextEmbedding::try_new(options)
                    .map_err(|e| RecallError::Embedding(e.to_string()))?;

                Ok(Arc::new(model))
            })
            .cloned()
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.get_or_init_model()?;
        let texts = texts.to_vec();
        let count = texts.len();

        // fastembed is synchronous
        let embeddings = task::spawn_blocking(move || {
            model
                .embed(texts, None)
                .map_err(|e| RecallError::Embedding(e.to_string()))
        })
        .await??;

        debug!(batch_size = count, "Generated embeddings");
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_models() {
        assert_eq!(resolve_model("bge-small-en-v1.5").unwrap().1, 384);
        assert_eq!(resolve_model("BGEBaseENV15").unwrap().1, 768);
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        assert!(matches!(
            resolve_model("word2vec"),
            Err(RecallError::Config(_))
        ));
    }

    #[test]
    fn test_model_is_lazy() {
        let embedder = FastEmbedder::new(DEFAULT_MODEL).unwrap();
        assert_eq!(embedder.dimension(), 384);
        assert!(embedder.model.get().is_none());
    }
}
