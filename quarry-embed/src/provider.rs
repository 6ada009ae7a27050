//! Embedding provider trait and shared helpers

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use crate::hashing::HashingEmbedProvider;
use crate::http::HttpEmbedProvider;
use async_trait::async_trait;
use std::sync::Arc;

/// Result of embedding generation
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result from a vector of embeddings.
    ///
    /// The dimension is inferred from the first embedding vector.
    /// If the embeddings vector is empty, dimension defaults to 0.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Fail with [`EmbedError::DimensionMismatch`] unless every vector has `expected` entries.
    pub fn ensure_dimension(&self, expected: usize) -> Result<()> {
        match self.embeddings.iter().find(|e| e.len() != expected) {
            Some(bad) => Err(EmbedError::DimensionMismatch {
                expected,
                actual: bad.len(),
            }),
            None => Ok(()),
        }
    }
}

/// Trait for embedding providers that can generate embeddings from text.
///
/// Implementations must be deterministic for a fixed model version and must
/// return vectors of exactly [`embedding_dimension`](Self::embedding_dimension) entries.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate embeddings for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let texts = vec![text.to_string()];
        let result = self.embed_texts(&texts).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_response("No embedding generated for text"))
    }

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Get the name of the model behind this provider
    fn model_name(&self) -> &str;

    /// Check that the backend is reachable and answers with well-formed vectors
    async fn health_check(&self) -> Result<()> {
        let sample = self.embed_text("health check").await?;
        if sample.len() != self.embedding_dimension() {
            return Err(EmbedError::DimensionMismatch {
                expected: self.embedding_dimension(),
                actual: sample.len(),
            });
        }
        Ok(())
    }
}

/// Scale `vector` to unit L2 norm in place. Zero vectors are left untouched.
pub fn normalize_l2(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Construct the provider described by `config`.
///
/// # Errors
/// - [`EmbedError::InvalidConfig`] for invalid settings, or when the `fastembed`
///   provider is requested from a build without the `fastembed` feature
/// - Model initialization errors from local providers
pub async fn create_provider(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;

    tracing::info!(
        "Creating {} embedding provider for model: {}",
        config.provider,
        config.model_name
    );

    match config.provider {
        ProviderKind::Hashing => Ok(Arc::new(HashingEmbedProvider::from_config(config))),
        ProviderKind::Http => Ok(Arc::new(HttpEmbedProvider::new(config.clone())?)),
        #[cfg(feature = "fastembed")]
        ProviderKind::FastEmbed => Ok(Arc::new(
            crate::onnx::FastEmbedProvider::create(config.clone()).await?,
        )),
        #[cfg(not(feature = "fastembed"))]
        ProviderKind::FastEmbed => Err(EmbedError::invalid_config(
            "the fastembed provider requires building with the `fastembed` feature",
        )),
    }
}
