//! Deterministic feature-hashing embedder.
//!
//! Every lowercased alphanumeric token (and every adjacent token pair) is hashed
//! with FNV-1a into one of `dimension` buckets with a hash-derived sign, and the
//! resulting bag-of-features vector is L2-normalized. Texts that share vocabulary
//! therefore land close together under cosine similarity.
//!
//! The output depends only on the input text and the dimension, which makes this
//! provider suitable for tests, offline operation, and as a baseline model.

use crate::config::EmbedConfig;
use crate::error::Result;
use crate::provider::{EmbeddingProvider, EmbeddingResult, normalize_l2};
use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;

/// Weight of a token-pair feature relative to a single token.
const BIGRAM_WEIGHT: f32 = 0.5;

/// Local embedding provider based on signed feature hashing
#[derive(Debug, Clone)]
pub struct HashingEmbedProvider {
    model_name: String,
    dimension: usize,
    normalize: bool,
}

impl HashingEmbedProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_name: "hashing-v1".to_string(),
            dimension: dimension.max(1),
            normalize: true,
        }
    }

    pub fn from_config(config: &EmbedConfig) -> Self {
        Self {
            model_name: config.model_name.clone(),
            dimension: config.dimension.max(1),
            normalize: config.normalize,
        }
    }

    /// Embed a single text synchronously.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.is_empty() {
            // Punctuation-only or empty input still maps to a stable, non-zero vector.
            self.add_feature(&mut vector, lowered.trim().as_bytes(), 1.0);
        }

        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let feature = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, feature.as_bytes(), BIGRAM_WEIGHT);
        }

        if self.normalize {
            normalize_l2(&mut vector);
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let mut hasher = FnvHasher::default();
        hasher.write(feature);
        let hash = hasher.finish();

        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        tracing::debug!("Hashing embeddings for {} texts", texts.len());
        let embeddings = texts.iter().map(|t| self.embed_sync(t)).collect();
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "hashing"
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
