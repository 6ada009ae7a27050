//! Configuration for embedding providers

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted for the embedding service API key.
pub const API_KEY_ENV: &str = "QUARRY_EMBED_API_KEY";

/// Which embedding backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Deterministic local feature-hashing embedder
    Hashing,
    /// Remote sentence-embedding service
    Http,
    /// Local ONNX model through fastembed (requires the `fastembed` feature)
    #[serde(rename = "fastembed")]
    FastEmbed,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Hashing => "hashing",
            Self::Http => "http",
            Self::FastEmbed => "fastembed",
        };
        f.write_str(name)
    }
}

/// Configuration for embedding providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Backend to use
    pub provider: ProviderKind,
    /// Name of the embedding model; persisted with the index to detect incompatible reuse
    pub model_name: String,
    /// Dimension of the vectors the model produces
    pub dimension: usize,
    /// Base URL of the embedding service (http provider only), e.g. `http://localhost:8080/v1`
    pub endpoint: Option<String>,
    /// Bearer token for the embedding service; falls back to `QUARRY_EMBED_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Maximum number of texts sent to the backend in one request
    pub batch_size: usize,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Whether to L2-normalize embeddings before returning them
    pub normalize: bool,
    /// Model cache directory for local models
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Hashing,
            model_name: "hashing-v1".to_string(),
            dimension: 384,
            endpoint: None,
            api_key: None,
            batch_size: 1000,
            request_timeout_secs: 30,
            normalize: true,
            cache_dir: None,
        }
    }
}

impl EmbedConfig {
    /// Create a configuration for the local hashing embedder
    pub fn hashing(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    /// Create a configuration for a remote embedding service
    pub fn http(
        endpoint: impl Into<String>,
        model_name: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            provider: ProviderKind::Http,
            model_name: model_name.into(),
            dimension,
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Create a configuration for the all-MiniLM-L6-v2 model served by fastembed
    pub fn fastembed_minilm() -> Self {
        Self {
            provider: ProviderKind::FastEmbed,
            model_name: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            batch_size: 256,
            ..Self::default()
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set the API key (builder style)
    pub fn with_api_key<S: Into<String>>(self, api_key: S) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..self
        }
    }

    /// Set the per-request timeout (builder style)
    pub fn with_request_timeout(self, timeout: Duration) -> Self {
        Self {
            request_timeout_secs: timeout.as_secs().max(1),
            ..self
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The configured API key, or the one from the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|key| !key.is_empty())
    }

    /// Check the configuration for settings no provider can work with
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_name must not be empty"));
        }
        if self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be positive"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be positive"));
        }
        if self.request_timeout_secs == 0 {
            return Err(EmbedError::invalid_config(
                "request_timeout_secs must be positive",
            ));
        }
        if self.provider == ProviderKind::Http {
            match self.endpoint.as_deref() {
                Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {}
                Some(endpoint) => {
                    return Err(EmbedError::invalid_config(format!(
                        "endpoint must be an http(s) URL, got '{endpoint}'"
                    )));
                }
                None => {
                    return Err(EmbedError::invalid_config(
                        "the http provider requires an endpoint",
                    ));
                }
            }
        }

        tracing::debug!("Embedding configuration valid for: {}", self.model_name);
        Ok(())
    }
}
