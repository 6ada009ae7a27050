//! Engine configuration.
//!
//! Loaded from TOML with every field optional:
//!
//! ```toml
//! index_dir = "/var/lib/quarry"
//! chunk_size = 200
//! chunk_overlap = 50
//! embed_batch_size = 1000
//! embed_timeout_secs = 30
//! max_retries = 3
//! default_top_k = 5
//!
//! [embed]
//! provider = "http"
//! model_name = "bge-small-en-v1.5"
//! dimension = 384
//! endpoint = "http://localhost:8080/v1"
//! ```
//!
//! `QUARRY_INDEX_DIR` and `QUARRY_EMBED_ENDPOINT` override the file; the API key is
//! read from `QUARRY_EMBED_API_KEY` by the embedding client itself.

use crate::error::{Result, RetrievalError};
use quarry_context::WordChunker;
use quarry_embed::{EmbedConfig, ProviderKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const INDEX_DIR_ENV: &str = "QUARRY_INDEX_DIR";
pub const EMBED_ENDPOINT_ENV: &str = "QUARRY_EMBED_ENDPOINT";

/// Configuration for the retrieval engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the persisted index artifacts
    pub index_dir: PathBuf,
    /// Words per chunk
    pub chunk_size: usize,
    /// Words shared by consecutive chunks
    pub chunk_overlap: usize,
    /// Chunks per embedding request; also the cancellation granularity of a build
    pub embed_batch_size: usize,
    /// Upper bound on a single embedding batch
    pub embed_timeout_secs: u64,
    /// Retries of a batch after a transient backend failure
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt
    pub retry_backoff_ms: u64,
    pub default_top_k: usize,
    pub embed: EmbedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from(".quarry"),
            chunk_size: 200,
            chunk_overlap: 50,
            embed_batch_size: 1000,
            embed_timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 200,
            default_top_k: 5,
            embed: EmbedConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration storing its index under `index_dir`.
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            ..Self::default()
        }
    }

    /// Read a TOML configuration file, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RetrievalError::invalid_config(e.to_string()))
    }

    /// Apply `QUARRY_INDEX_DIR` and `QUARRY_EMBED_ENDPOINT` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os(INDEX_DIR_ENV).filter(|v| !v.is_empty()) {
            self.index_dir = PathBuf::from(dir);
        }
        if let Ok(endpoint) = std::env::var(EMBED_ENDPOINT_ENV) {
            if !endpoint.is_empty() {
                self.apply_endpoint(endpoint);
            }
        }
        self
    }

    /// Point the engine at a remote embedding service. Switches the provider to `http`.
    pub fn apply_endpoint(&mut self, endpoint: String) {
        self.embed.endpoint = Some(endpoint);
        self.embed.provider = ProviderKind::Http;
    }

    pub fn with_index_dir(mut self, index_dir: impl Into<PathBuf>) -> Self {
        self.index_dir = index_dir.into();
        self
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    pub fn with_embed_batch_size(mut self, batch_size: usize) -> Self {
        self.embed_batch_size = batch_size;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_embed_config(mut self, embed: EmbedConfig) -> Self {
        self.embed = embed;
        self
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// The chunker these settings describe.
    pub fn chunker(&self) -> Result<WordChunker> {
        Ok(WordChunker::new(self.chunk_size, self.chunk_overlap)?)
    }

    /// Reject settings that can never work. Performs no I/O.
    pub fn validate(&self) -> Result<()> {
        self.chunker()?;
        if self.embed_batch_size == 0 {
            return Err(RetrievalError::invalid_config(
                "embed_batch_size must be positive",
            ));
        }
        if self.embed_timeout_secs == 0 {
            return Err(RetrievalError::invalid_config(
                "embed_timeout_secs must be positive",
            ));
        }
        if self.default_top_k == 0 {
            return Err(RetrievalError::invalid_config(
                "default_top_k must be positive",
            ));
        }
        self.embed.validate()?;
        Ok(())
    }
}
