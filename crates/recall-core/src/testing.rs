//! Test doubles shared by unit tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{RecallError, Result};
use crate::index::Embedder;

const VOCAB: &[&str] = &[
    "null",
    "pointer",
    "check",
    "fixed",
    "deployment",
    "pipeline",
    "database",
    "cache",
    "test",
    "config",
];

/// Deterministic bag-of-words embedder: one dimension per known word plus
/// one shared bucket for everything else.
#[derive(Default)]
pub struct KeywordEmbedder {
    batch_calls: AtomicUsize,
    fail: AtomicBool,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; VOCAB.len() + 1];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            match VOCAB.iter().position(|known| *known == word) {
                Some(idx) => v[idx] += 1.0,
                None => v[VOCAB.len()] += 0.1,
            }
        }
        v[VOCAB.len()] += 0.01;

        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn dimension(&self) -> usize {
        VOCAB.len() + 1
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RecallError::Embedding("embedder offline".into()));
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}
