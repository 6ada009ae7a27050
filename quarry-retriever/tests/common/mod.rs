//! Embedding providers with scripted behaviour, shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use quarry_context::Document;
use quarry_embed::{EmbedError, EmbeddingProvider, EmbeddingResult, HashingEmbedProvider};
use quarry_retriever::{EngineConfig, RetrievalEngine, source::MemorySource};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

pub const DIMENSION: usize = 256;

/// Returns a fixed vector per text; unknown texts are an error.
pub struct ScriptedProvider {
    dimension: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl ScriptedProvider {
    pub fn new(dimension: usize, vectors: impl IntoIterator<Item = (&'static str, Vec<f32>)>) -> Self {
        Self {
            dimension,
            vectors: vectors
                .into_iter()
                .map(|(text, vector)| (text.to_string(), vector))
                .collect(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
        let embeddings = texts
            .iter()
            .map(|text| {
                self.vectors
                    .get(text)
                    .cloned()
                    .ok_or_else(|| EmbedError::invalid_response(format!("no scripted vector for '{text}'")))
            })
            .collect::<quarry_embed::Result<Vec<_>>>()?;
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Hashing embeddings, counting calls and texts.
pub struct CountingProvider {
    inner: HashingEmbedProvider,
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
}

impl CountingProvider {
    pub fn new() -> Self {
        Self {
            inner: HashingEmbedProvider::new(DIMENSION),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.texts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "counting"
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Hashing embeddings that can be switched off to simulate a backend outage.
pub struct SwitchableProvider {
    inner: HashingEmbedProvider,
    online: AtomicBool,
}

impl SwitchableProvider {
    pub fn new() -> Self {
        Self {
            inner: HashingEmbedProvider::new(DIMENSION),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for SwitchableProvider {
    async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(EmbedError::unavailable("connection refused"));
        }
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "switchable"
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Hashing embeddings of the shared dimension reported under another model name.
pub struct RenamedModelProvider {
    inner: HashingEmbedProvider,
    model: &'static str,
}

impl RenamedModelProvider {
    pub fn new(model: &'static str) -> Self {
        Self {
            inner: HashingEmbedProvider::new(DIMENSION),
            model,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RenamedModelProvider {
    async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "renamed"
    }

    fn model_name(&self) -> &str {
        self.model
    }
}

/// Hashing embeddings that take `delay` to arrive.
pub struct SlowProvider {
    inner: HashingEmbedProvider,
    delay: Duration,
}

impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: HashingEmbedProvider::new(DIMENSION),
            delay,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for SlowProvider {
    async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "slow"
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Hashing embeddings where, while the gate is closed, every multi-text batch
/// waits for a permit. Single-text calls (queries) always pass, so reads keep
/// working while a build is held mid-embedding.
pub struct BatchGate {
    inner: HashingEmbedProvider,
    closed: AtomicBool,
    /// Signalled each time a batch starts waiting
    pub entered: Notify,
    release: Semaphore,
}

impl BatchGate {
    pub fn new() -> Self {
        Self {
            inner: HashingEmbedProvider::new(DIMENSION),
            closed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Open the gate and let every waiting batch through.
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.release.add_permits(1024);
    }

    /// Let exactly one waiting batch through.
    pub fn release_one(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl EmbeddingProvider for BatchGate {
    async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
        if texts.len() > 1 && self.closed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            let permit = self
                .release
                .acquire()
                .await
                .map_err(|e| EmbedError::unavailable(e.to_string()))?;
            permit.forget();
        }
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        self.inner.embedding_dimension()
    }

    fn provider_name(&self) -> &str {
        "gated"
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

pub fn tender_corpus() -> Vec<Document> {
    vec![
        Document::new(
            "t-100",
            "Resurfacing of the northern ring road including drainage channels, kerbs, and road markings",
        )
        .with_source_dataset("works")
        .with_metadata("budget", 450_000),
        Document::new(
            "t-101",
            "Structural repair of the river bridge deck and replacement of expansion joints",
        )
        .with_source_dataset("works")
        .with_metadata("budget", 1_200_000),
        Document::new(
            "t-102",
            "School catering services providing hot lunches and healthy snacks for primary schools",
        )
        .with_source_dataset("services"),
        Document::new(
            "t-103",
            "Supply of office furniture including desks, chairs, and filing cabinets for the town hall",
        )
        .with_source_dataset("supplies"),
        Document::new(
            "t-104",
            "Cleaning services for municipal buildings, libraries, and sports centres on a weekly schedule",
        )
        .with_source_dataset("services"),
    ]
}

/// Small chunks and fast retries so tests exercise several chunks per document.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir)
        .with_chunking(6, 2)
        .with_embed_batch_size(4)
        .with_retries(1, Duration::from_millis(1))
}

pub fn engine_with(dir: &Path, provider: Arc<dyn EmbeddingProvider>, documents: Vec<Document>) -> RetrievalEngine {
    RetrievalEngine::new(test_config(dir), provider, Arc::new(MemorySource::new(documents)))
        .expect("valid test configuration")
}
