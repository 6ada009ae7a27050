//! Client for a remote sentence-embedding service.
//!
//! Speaks the OpenAI-compatible embeddings protocol that most self-hosted
//! embedding servers (text-embeddings-inference, vLLM, llama.cpp, Ollama) expose:
//!
//! ```text
//! POST {endpoint}/embeddings
//! {"model": "<model_name>", "input": ["text", ...]}
//!
//! 200 OK
//! {"data": [{"index": 0, "embedding": [0.1, ...]}, ...]}
//! ```
//!
//! Transport failures, 5xx answers, and rate limiting surface as
//! [`EmbedError::BackendUnavailable`]; a request exceeding the configured timeout
//! surfaces as [`EmbedError::Timeout`]. Both are transient and may be retried by
//! callers. Other 4xx answers are configuration problems and are not.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, normalize_l2};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Embedding provider backed by a remote HTTP service
#[derive(Clone)]
pub struct HttpEmbedProvider {
    config: EmbedConfig,
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for HttpEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedProvider")
            .field("url", &self.url)
            .field("model", &self.config.model_name)
            .field("dimension", &self.config.dimension)
            .field("api_key", &self.api_key.is_some())
            .finish()
    }
}

impl HttpEmbedProvider {
    /// Build a client for the service described by `config`. No request is made.
    pub fn new(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| EmbedError::invalid_config("the http provider requires an endpoint"))?;
        let url = format!("{}/embeddings", endpoint.trim_end_matches('/'));

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(EmbedError::model_init)?;

        Ok(Self {
            api_key: config.resolved_api_key(),
            config,
            client,
            url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self.client.post(&self.url).json(&EmbeddingRequest {
            model: &self.config.model_name,
            input: batch,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbedError::unavailable(format!(
                "{} answered {}",
                self.url, status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::invalid_config(format!(
                "embedding service rejected the request ({status}): {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let payload: EmbeddingResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.classify(e)
            } else {
                EmbedError::invalid_response(e.to_string())
            }
        })?;

        if payload.data.len() != batch.len() {
            return Err(EmbedError::invalid_response(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                payload.data.len()
            )));
        }

        let mut data = payload.data;
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }

        let mut embeddings = Vec::with_capacity(data.len());
        for datum in data {
            let mut embedding = datum.embedding;
            if embedding.len() != self.config.dimension {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.config.dimension,
                    actual: embedding.len(),
                });
            }
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(EmbedError::invalid_response(
                    "non-finite values in embedding",
                ));
            }
            if self.config.normalize {
                normalize_l2(&mut embedding);
            }
            embeddings.push(embedding);
        }
        Ok(embeddings)
    }

    fn classify(&self, error: reqwest::Error) -> EmbedError {
        if error.is_timeout() {
            EmbedError::Timeout {
                timeout: self.config.request_timeout(),
            }
        } else if error.is_builder() {
            EmbedError::invalid_config(error.to_string())
        } else {
            EmbedError::unavailable(format!("{}: {error}", self.url))
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        tracing::debug!("Requesting embeddings for {} texts from {}", texts.len(), self.url);

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.batch_size) {
            let embeddings = self.embed_batch(batch).await?;
            all_embeddings.extend(embeddings);
        }

        Ok(EmbeddingResult::new(all_embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        "http"
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}
