//! Batched embedding with per-batch timeouts and bounded retries

use crate::config::EngineConfig;
use crate::error::{Result, RetrievalError};
use quarry_embed::EmbeddingProvider;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Drives an [`EmbeddingProvider`] in fixed-size batches
#[derive(Clone)]
pub struct BatchEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl std::fmt::Debug for BatchEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEmbedder")
            .field("provider", &self.provider.provider_name())
            .field("batch_size", &self.batch_size)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl BatchEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EngineConfig) -> Self {
        Self {
            provider,
            batch_size: config.embed_batch_size.max(1),
            timeout: config.embed_timeout(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn dimension(&self) -> usize {
        self.provider.embedding_dimension()
    }

    /// Embed every text, batch by batch.
    ///
    /// `cancel` is checked before each batch; `progress` receives the running count
    /// of embedded texts after each batch.
    pub async fn embed_all<F>(
        &self,
        texts: &[String],
        cancel: &AtomicBool,
        mut progress: F,
    ) -> Result<Vec<Vec<f32>>>
    where
        F: FnMut(usize),
    {
        let mut embeddings = Vec::with_capacity(texts.len());
        for (batch_number, batch) in texts.chunks(self.batch_size).enumerate() {
            if cancel.load(Ordering::Acquire) {
                debug!("Cancellation requested before batch {}", batch_number);
                return Err(RetrievalError::Cancelled);
            }
            let vectors = self.embed_batch(batch).await?;
            embeddings.extend(vectors);
            progress(embeddings.len());
        }
        Ok(embeddings)
    }

    /// Embed one batch, retrying transient failures with exponential backoff.
    pub async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0;
        loop {
            match self.try_embed(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "Embedding batch of {} failed ({}), retry {}/{} in {:?}",
                        batch.len(),
                        e,
                        attempt,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Embed a single query text in one attempt.
    ///
    /// Queries are not retried: a transient failure goes straight back to the
    /// caller so retrieval can degrade to lexical scoring without waiting out
    /// the backoff schedule.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = self.try_embed(&[query.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            RetrievalError::Embedding(quarry_embed::EmbedError::invalid_response(
                "no embedding returned for query",
            ))
        })
    }

    async fn try_embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let result = tokio::time::timeout(self.timeout, self.provider.embed_texts(batch))
            .await
            .map_err(|_| RetrievalError::Timeout {
                timeout: self.timeout,
            })??;

        if result.len() != batch.len() {
            return Err(RetrievalError::Embedding(
                quarry_embed::EmbedError::invalid_response(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    result.len()
                )),
            ));
        }
        result.ensure_dimension(self.dimension())?;
        Ok(result.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quarry_embed::{EmbedError, EmbeddingResult, HashingEmbedProvider};
    use std::sync::atomic::AtomicUsize;

    /// Fails with `BackendUnavailable` for the first `failures` calls.
    struct Flaky {
        inner: HashingEmbedProvider,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(EmbedError::unavailable("connection refused"));
            }
            self.inner.embed_texts(texts).await
        }

        fn embedding_dimension(&self) -> usize {
            self.inner.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            "flaky"
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_embed_batch_size(2)
            .with_retries(2, Duration::from_millis(1))
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text number {i}")).collect()
    }

    #[tokio::test]
    async fn test_batches_and_reports_progress() -> Result<()> {
        let embedder = BatchEmbedder::new(Arc::new(HashingEmbedProvider::new(8)), &config());
        let mut seen = Vec::new();

        let vectors = embedder
            .embed_all(&texts(5), &AtomicBool::new(false), |done| seen.push(done))
            .await?;

        assert_eq!(vectors.len(), 5);
        assert_eq!(seen, vec![2, 4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() -> Result<()> {
        let provider = Arc::new(Flaky {
            inner: HashingEmbedProvider::new(8),
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let embedder = BatchEmbedder::new(provider.clone(), &config());

        let vectors = embedder.embed_batch(&texts(2)).await?;
        assert_eq!(vectors.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = Arc::new(Flaky {
            inner: HashingEmbedProvider::new(8),
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let embedder = BatchEmbedder::new(provider.clone(), &config());

        let err = embedder.embed_batch(&texts(1)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::BackendUnavailable { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_query_embedding_is_single_attempt() -> Result<()> {
        let provider = Arc::new(Flaky {
            inner: HashingEmbedProvider::new(8),
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let embedder = BatchEmbedder::new(provider.clone(), &config());

        let err = embedder.embed_query("anything").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // The backend recovered, so the next query succeeds first time.
        assert_eq!(embedder.embed_query("anything").await?.len(), 8);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_batch() {
        let embedder = BatchEmbedder::new(Arc::new(HashingEmbedProvider::new(8)), &config());
        let cancel = AtomicBool::new(true);

        let err = embedder.embed_all(&texts(4), &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Cancelled));
    }
}
