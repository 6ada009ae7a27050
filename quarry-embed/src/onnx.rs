//! Local ONNX embedding models through fastembed.
//!
//! Models are downloaded on first use into `cache_dir` (or fastembed's default
//! cache) and kept in a process-wide cache keyed by configuration, so several
//! engines sharing a model load it only once. Inference runs on the blocking
//! thread pool.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, normalize_l2};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, OnceLock};

/// Type alias for cached model entries (model, dimension)
type ModelCacheEntry = (Arc<Mutex<TextEmbedding>>, usize);

/// Global cache for initialized embedding models to avoid reloading
static MODEL_CACHE: OnceLock<Mutex<HashMap<String, ModelCacheEntry>>> = OnceLock::new();

fn get_model_cache() -> &'static Mutex<HashMap<String, ModelCacheEntry>> {
    MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn poisoned() -> EmbedError {
    EmbedError::External {
        source: anyhow::anyhow!("embedding model lock poisoned"),
    }
}

/// Map a configured model name onto one of fastembed's built-in models.
fn builtin_model(name: &str) -> Result<EmbeddingModel> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
            Ok(EmbeddingModel::AllMiniLML6V2)
        }
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        other => Err(EmbedError::invalid_config(format!(
            "unsupported fastembed model '{other}'"
        ))),
    }
}

/// FastEmbed-based embedding provider using real ONNX models
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Load (or reuse from cache) the model described by `config`.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        tracing::info!("Initializing FastEmbed provider for model: {}", config.model_name);

        let model_kind = builtin_model(&config.model_name)?;
        let cache_key = cache_key(&config)?;

        let cached = {
            let cache = get_model_cache().lock().map_err(|_| poisoned())?;
            cache
                .get(&cache_key)
                .map(|(model, dim)| (Arc::clone(model), *dim))
        };

        let (model, dimension) = match cached {
            Some(entry) => {
                tracing::info!("Using cached model for: {}", config.model_name);
                entry
            }
            None => {
                let load_config = config.clone();
                let (model, dimension) =
                    tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                        let mut options =
                            InitOptions::new(model_kind).with_show_download_progress(false);
                        if let Some(dir) = &load_config.cache_dir {
                            options = options.with_cache_dir(dir.clone());
                        }

                        let mut model = TextEmbedding::try_new(options)
                            .map_err(|e| EmbedError::External { source: e })?;
                        let sample = model
                            .embed(vec!["dimension check".to_string()], None)
                            .map_err(|e| EmbedError::External { source: e })?;
                        let dimension = sample.first().map(|e| e.len()).unwrap_or(0);

                        tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                        Ok((model, dimension))
                    })
                    .await??;

                let model = Arc::new(Mutex::new(model));
                get_model_cache()
                    .lock()
                    .map_err(|_| poisoned())?
                    .insert(cache_key, (Arc::clone(&model), dimension));
                (model, dimension)
            }
        };

        if dimension != config.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: config.dimension,
                actual: dimension,
            });
        }

        Ok(Self {
            config,
            model,
            dimension,
        })
    }

    /// Drop every cached model
    pub fn clear_cache() {
        if let Ok(mut cache) = get_model_cache().lock() {
            cache.clear();
        }
    }
}

fn cache_key(config: &EmbedConfig) -> Result<String> {
    let config_json = serde_json::to_string(config).map_err(|e| EmbedError::External {
        source: e.into(),
    })?;
    let mut hasher = FnvHasher::default();
    hasher.write(config_json.as_bytes());
    Ok(format!("v1:{:x}", hasher.finish()))
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.config.batch_size;
        let normalize = self.config.normalize;

        let embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model = model.lock().map_err(|_| poisoned())?;
            let mut embeddings = model
                .embed(texts, Some(batch_size))
                .map_err(|e| EmbedError::External { source: e })?;
            if normalize {
                embeddings.iter_mut().for_each(|e| normalize_l2(e));
            }
            Ok(embeddings)
        })
        .await??;

        let result = EmbeddingResult::new(embeddings);
        result.ensure_dimension(self.dimension)?;
        Ok(result)
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}
