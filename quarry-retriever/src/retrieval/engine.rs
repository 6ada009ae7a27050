//! The retrieval engine: builds, mutates, persists, and queries the index.
//!
//! Readers always work on an `Arc<IndexSnapshot>` taken under a brief read lock,
//! so a query sees one consistent generation from start to finish. Writers
//! (`build_index`, `add_documents`, `delete_documents`) serialize on a single
//! async mutex, prepare a new snapshot off to the side, persist it, and only
//! then swap it in under the write lock.

use super::build_status::{BuildGuard, BuildOutcome, BuildPhase, BuildReport, BuildStatus, EngineState};
use super::embedder::BatchEmbedder;
use super::lexical;
use super::vector_index::SearchHit;
use crate::config::EngineConfig;
use crate::error::{Result, RetrievalError};
use crate::source::DocumentSource;
use crate::status::{IndexHealth, IndexStatistics, StatusApi};
use crate::storage::{ArtifactStore, FileArtifactStore, IndexConfig, IndexSnapshot, StoredChunk};
use chrono::Utc;
use itertools::Itertools;
use quarry_context::{ChunkId, ChunkMetadata, Document, TextChunk, WordChunker};
use quarry_embed::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

/// How a result set was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    /// Vector similarity against the query embedding
    Semantic,
    /// Term-overlap fallback used while the embedding backend is unreachable
    Lexical,
}

impl std::fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Semantic => f.write_str("semantic"),
            Self::Lexical => f.write_str("lexical"),
        }
    }
}

/// One ranked chunk, joined with its text and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: ChunkId,
    pub text: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub query: String,
    pub retrieval_method: RetrievalMethod,
    pub results: Vec<RetrievedChunk>,
}

impl RetrievalResponse {
    fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            retrieval_method: RetrievalMethod::Semantic,
            results: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Query parameters beyond the query text
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalOptions {
    pub k: usize,
    /// Drop results scoring below this value
    pub min_score: Option<f32>,
    /// Only consider chunks from this dataset
    pub source_dataset: Option<String>,
}

impl RetrievalOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            min_score: None,
            source_dataset: None,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_source_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.source_dataset = Some(dataset.into());
        self
    }
}

/// Orchestrates chunking, embedding, indexing, and persistence.
///
/// # Lifecycle
///
/// A new engine is [`EngineState::Unbuilt`] and answers every query with an empty
/// result set. [`build_index`](Self::build_index) either loads the persisted
/// generation or runs the full pipeline, and leaves the engine
/// [`Ready`](EngineState::Ready). Only one build runs at a time; a second request
/// fails immediately with [`RetrievalError::ConcurrentBuildRejected`].
pub struct RetrievalEngine {
    config: EngineConfig,
    chunker: WordChunker,
    embedder: BatchEmbedder,
    source: Arc<dyn DocumentSource>,
    store: Arc<dyn ArtifactStore>,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
    /// Serializes everything that replaces the snapshot
    writer: Mutex<()>,
    building: AtomicBool,
    cancel: AtomicBool,
    status: watch::Sender<BuildStatus>,
    state: watch::Sender<EngineState>,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("index_dir", &self.config.index_dir)
            .field("embedder", &self.embedder)
            .field("source", &self.source.describe())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl RetrievalEngine {
    /// Create an engine persisting to `config.index_dir`.
    ///
    /// Chunking and batching parameters are validated here, before any I/O.
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn EmbeddingProvider>,
        source: Arc<dyn DocumentSource>,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = config.chunker()?;
        let embedder = BatchEmbedder::new(provider, &config);
        let store: Arc<dyn ArtifactStore> = Arc::new(FileArtifactStore::new(&config.index_dir));
        let (status, _) = watch::channel(BuildStatus::default());
        let (state, _) = watch::channel(EngineState::Unbuilt);

        Ok(Self {
            config,
            chunker,
            embedder,
            source,
            store,
            snapshot: RwLock::new(None),
            writer: Mutex::new(()),
            building: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            status,
            state,
        })
    }

    /// Replace the artifact store.
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        self.embedder.provider()
    }

    pub fn source(&self) -> &Arc<dyn DocumentSource> {
        &self.source
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Progress of the running or most recent build. Never blocks.
    pub fn build_status(&self) -> BuildStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_build_status(&self) -> watch::Receiver<BuildStatus> {
        self.status.subscribe()
    }

    /// The generation queries currently run against
    pub async fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.snapshot.read().await.clone()
    }

    /// Ask the running build to stop at the next batch boundary.
    ///
    /// Returns `false` when no build is running.
    pub fn cancel_build(&self) -> bool {
        if !self.building.load(Ordering::Acquire) {
            return false;
        }
        info!("Cancellation requested for running build");
        self.cancel.store(true, Ordering::Release);
        true
    }

    /// Load the persisted index, or build one from the document source.
    ///
    /// With `force_rebuild == false` a valid persisted generation is loaded without
    /// recomputing anything. A persisted index that is missing or corrupt triggers
    /// the full pipeline; one whose dimension or model disagrees with the embedding
    /// provider is a fatal [`RetrievalError::DimensionMismatch`] or
    /// [`RetrievalError::ModelMismatch`].
    ///
    /// A cancelled or failed build leaves the previous generation in place, in
    /// memory and on disk.
    pub async fn build_index(&self, force_rebuild: bool) -> Result<BuildReport> {
        let mode = if force_rebuild {
            BuildMode::Rebuild
        } else {
            BuildMode::LoadOrBuild
        };
        self.guarded_build(mode).await
    }

    /// Load the persisted index without ever falling back to the pipeline.
    ///
    /// Fails with [`RetrievalError::NotFound`] or [`RetrievalError::CorruptArtifact`]
    /// where `build_index(false)` would rebuild.
    pub async fn load_index(&self) -> Result<BuildReport> {
        self.guarded_build(BuildMode::LoadOnly).await
    }

    async fn guarded_build(&self, mode: BuildMode) -> Result<BuildReport> {
        let Some(mut guard) = BuildGuard::try_acquire(&self.building) else {
            warn!("Rejecting build request: a build is already running");
            return Err(RetrievalError::ConcurrentBuildRejected);
        };
        self.cancel.store(false, Ordering::Release);

        let previous_state = guard.begin(&self.status, &self.state);
        info!("Starting index build ({:?}) from {}", mode, self.source.describe());

        let started = Instant::now();
        let result = self.run_build(mode, started).await;

        match &result {
            Ok(report) => {
                self.status.send_modify(|s| s.finish(BuildPhase::Completed, None));
                self.state.send_replace(EngineState::Ready);
                info!(
                    "Index ready: {:?} generation {} with {} documents / {} chunks in {}ms",
                    report.outcome, report.generation, report.documents, report.chunks, report.elapsed_ms
                );
            }
            Err(RetrievalError::Cancelled) => {
                self.status
                    .send_modify(|s| s.finish(BuildPhase::Cancelled, Some("cancelled".to_string())));
                self.state.send_replace(previous_state);
                info!("Index build cancelled; previous generation kept");
            }
            Err(e) => {
                let message = e.to_string();
                self.status
                    .send_modify(|s| s.finish(BuildPhase::Failed, Some(message)));
                let next = if !e.is_fatal() && previous_state == EngineState::Ready {
                    EngineState::Ready
                } else {
                    EngineState::Failed
                };
                self.state.send_replace(next);
                error!("Index build failed: {}", e);
            }
        }
        guard.settle();
        result
    }

    async fn run_build(&self, mode: BuildMode, started: Instant) -> Result<BuildReport> {
        // Held for the whole build so incremental writes queue behind it.
        let _writer = self.writer.lock().await;

        if mode != BuildMode::Rebuild {
            match self.store.load().await {
                Ok(snapshot) => {
                    self.ensure_compatible(&snapshot.config)?;
                    let report = BuildReport {
                        outcome: BuildOutcome::Loaded,
                        documents: snapshot.config.num_documents,
                        chunks: snapshot.index.live_len(),
                        generation: snapshot.config.generation,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    };
                    *self.snapshot.write().await = Some(Arc::new(snapshot));
                    return Ok(report);
                }
                Err(e) if mode == BuildMode::LoadOnly => return Err(e),
                Err(RetrievalError::NotFound { path }) => {
                    debug!("No persisted index in {}; building from source", path.display());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Persisted index is unusable ({}); rebuilding from source", e),
            }
        }

        self.set_phase(BuildPhase::LoadingDocuments, 0.02);
        let documents = latest_by_id(self.source.load_documents().await?);
        self.status.send_modify(|s| s.documents = documents.len());

        self.set_phase(BuildPhase::Chunking, 0.05);
        let chunks: Vec<TextChunk> = documents
            .iter()
            .flat_map(|document| self.chunker.chunk_document(document))
            .collect();
        info!("Chunked {} documents into {} chunks", documents.len(), chunks.len());
        self.status.send_modify(|s| s.chunks_total = chunks.len());

        self.set_phase(BuildPhase::Embedding, 0.1);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_all(&texts, &self.cancel, |embedded| {
                self.status.send_modify(|s| s.record_embedded(embedded));
            })
            .await?;

        self.set_phase(BuildPhase::Indexing, 0.9);
        let mut snapshot = IndexSnapshot::empty(self.fresh_index_config())?;
        append_chunks(&mut snapshot, chunks, vectors)?;
        snapshot.refresh_counts();

        if self.cancel.load(Ordering::Acquire) {
            return Err(RetrievalError::Cancelled);
        }

        self.set_phase(BuildPhase::Persisting, 0.95);
        let previous = self.current_generation().await;
        snapshot.config.generation = next_generation(previous);
        self.store.save(&snapshot).await?;

        let report = BuildReport {
            outcome: BuildOutcome::Built,
            documents: snapshot.config.num_documents,
            chunks: snapshot.index.live_len(),
            generation: snapshot.config.generation,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        *self.snapshot.write().await = Some(Arc::new(snapshot));
        Ok(report)
    }

    /// Chunk, embed, and append `documents` without touching the rest of the index.
    ///
    /// A document whose id is already indexed replaces the earlier version. Returns
    /// the number of documents ingested.
    ///
    /// # Errors
    /// - [`RetrievalError::InvalidDocument`] before any work if a document fails validation
    /// - [`RetrievalError::IndexNotReady`] if a persisted index exists but has not been loaded
    /// - embedding failures, including transient ones: there is no fallback for writes
    pub async fn add_documents(&self, documents: Vec<Document>) -> Result<usize> {
        for document in &documents {
            document.validate()?;
        }
        if documents.is_empty() {
            return Ok(0);
        }
        let documents = latest_by_id(documents);
        self.ensure_writable().await?;

        let chunks: Vec<TextChunk> = documents
            .iter()
            .flat_map(|document| self.chunker.chunk_document(document))
            .collect();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        debug!("Embedding {} chunks for {} new documents", texts.len(), documents.len());
        let vectors = self
            .embedder
            .embed_all(&texts, &AtomicBool::new(false), |_| {})
            .await?;

        let _writer = self.writer.lock().await;
        let mut snapshot = match self.snapshot().await {
            Some(current) => current.as_ref().clone(),
            None => {
                self.ensure_writable().await?;
                IndexSnapshot::empty(self.fresh_index_config())?
            }
        };

        for document in &documents {
            let superseded = chunk_ids_of(&snapshot, &document.id);
            if !superseded.is_empty() {
                debug!("Superseding {} chunks of {}", superseded.len(), document.id);
                snapshot.index.remove(&superseded);
            }
        }
        append_chunks(&mut snapshot, chunks, vectors)?;
        snapshot.refresh_counts();
        snapshot.config.generation = next_generation(snapshot.config.generation);

        self.install(snapshot).await?;
        info!("Added {} documents", documents.len());
        Ok(documents.len())
    }

    /// Tombstone every chunk of the named documents and persist.
    ///
    /// Returns how many of the named documents were present.
    pub async fn delete_documents(&self, document_ids: &[String]) -> Result<usize> {
        let _writer = self.writer.lock().await;
        let Some(current) = self.snapshot().await else {
            if self.store.exists().await {
                return Err(RetrievalError::IndexNotReady);
            }
            return Ok(0);
        };

        let mut snapshot = current.as_ref().clone();
        let mut removed_documents = 0;
        for id in document_ids.iter().unique() {
            let chunk_ids = chunk_ids_of(&snapshot, id);
            if snapshot.index.remove(&chunk_ids) > 0 {
                removed_documents += 1;
            }
        }
        if removed_documents == 0 {
            debug!("None of {} requested documents are indexed", document_ids.len());
            return Ok(0);
        }

        snapshot.refresh_counts();
        snapshot.config.generation = next_generation(snapshot.config.generation);
        self.install(snapshot).await?;

        info!("Deleted {} documents", removed_documents);
        Ok(removed_documents)
    }

    /// Persist and publish a generation written under the writer lock.
    ///
    /// A checked, persisted generation is queryable, so an `Unbuilt` or `Failed`
    /// engine becomes `Ready`. A pending `Building` state is left to its build.
    async fn install(&self, snapshot: IndexSnapshot) -> Result<()> {
        snapshot.check_invariant()?;
        self.store.save(&snapshot).await?;
        *self.snapshot.write().await = Some(Arc::new(snapshot));
        self.state.send_if_modified(|state| {
            let promote = matches!(state, EngineState::Unbuilt | EngineState::Failed);
            if promote {
                info!("Engine {} -> ready after incremental write", state);
                *state = EngineState::Ready;
            }
            promote
        });
        Ok(())
    }

    /// Top-`k` chunks for `query`.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalResponse> {
        self.retrieve_with(query, RetrievalOptions::new(k)).await
    }

    /// Top chunks for `query` under `options`.
    ///
    /// An engine with no live chunks returns an empty response without calling the
    /// embedding backend. When the single query embedding attempt finds the backend
    /// unavailable or times out, chunks are ranked lexically instead and the
    /// response says so.
    pub async fn retrieve_with(&self, query: &str, options: RetrievalOptions) -> Result<RetrievalResponse> {
        if options.k == 0 {
            return Err(RetrievalError::invalid_config("k must be at least 1"));
        }
        let Some(snapshot) = self.snapshot().await else {
            return Ok(RetrievalResponse::empty(query));
        };
        if snapshot.index.live_len() == 0 {
            return Ok(RetrievalResponse::empty(query));
        }

        let dataset = options.source_dataset.as_deref();
        let accepts = |position: usize| match dataset {
            None => true,
            Some(wanted) => snapshot
                .metadata
                .get(position)
                .is_some_and(|meta| meta.source_dataset.as_deref() == Some(wanted)),
        };

        let (retrieval_method, hits) = match self.embedder.embed_query(query).await {
            Ok(vector) => (
                RetrievalMethod::Semantic,
                snapshot.index.search_filtered(&vector, options.k, accepts)?,
            ),
            Err(e) if e.is_transient() => {
                warn!("Embedding backend unavailable ({}); falling back to lexical retrieval", e);
                let candidates = snapshot
                    .chunks
                    .iter()
                    .enumerate()
                    .filter(|(position, _)| snapshot.index.is_live(*position) && accepts(*position))
                    .map(|(position, chunk)| (position, chunk.text.as_str()));
                (
                    RetrievalMethod::Lexical,
                    lexical::search(query, candidates, options.k),
                )
            }
            Err(e) => return Err(e),
        };

        let results = hits
            .into_iter()
            .filter(|hit| options.min_score.is_none_or(|min| hit.score >= min))
            .filter_map(|hit| join_hit(&snapshot, hit))
            .collect();

        Ok(RetrievalResponse {
            query: query.to_string(),
            retrieval_method,
            results,
        })
    }

    /// Invariant, artifact, and backend checks with recommendations.
    pub async fn get_health(&self) -> Result<IndexHealth> {
        StatusApi::get_index_health(self).await
    }

    pub async fn get_statistics(&self) -> Result<IndexStatistics> {
        StatusApi::get_index_statistics(self).await
    }

    fn set_phase(&self, phase: BuildPhase, progress: f32) {
        debug!("Build phase: {:?}", phase);
        self.status.send_modify(|s| {
            s.phase = phase;
            s.progress = progress;
        });
    }

    fn fresh_index_config(&self) -> IndexConfig {
        IndexConfig::new(
            self.embedder.provider().model_name(),
            self.chunker.chunk_size(),
            self.chunker.overlap(),
            self.embedder.dimension(),
        )
    }

    fn ensure_compatible(&self, persisted: &IndexConfig) -> Result<()> {
        let provider_dimension = self.embedder.dimension();
        if persisted.dimension != provider_dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: persisted.dimension,
                actual: provider_dimension,
            });
        }
        let configured = self.embedder.provider().model_name();
        if persisted.model_name != configured {
            return Err(RetrievalError::ModelMismatch {
                persisted: persisted.model_name.clone(),
                configured: configured.to_string(),
            });
        }
        if persisted.chunk_size != self.chunker.chunk_size() || persisted.chunk_overlap != self.chunker.overlap() {
            warn!(
                "Persisted index uses chunking {}/{}, configuration says {}/{}; new documents use the configured values",
                persisted.chunk_size,
                persisted.chunk_overlap,
                self.chunker.chunk_size(),
                self.chunker.overlap()
            );
        }
        Ok(())
    }

    /// An unloaded engine may only start a fresh index when nothing is persisted.
    async fn ensure_writable(&self) -> Result<()> {
        if self.snapshot.read().await.is_none() && self.store.exists().await {
            return Err(RetrievalError::IndexNotReady);
        }
        Ok(())
    }

    async fn current_generation(&self) -> u64 {
        self.snapshot
            .read()
            .await
            .as_ref()
            .map(|s| s.config.generation)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildMode {
    LoadOnly,
    LoadOrBuild,
    Rebuild,
}

/// Keep the last occurrence of each document id, in order of last occurrence.
fn latest_by_id(documents: Vec<Document>) -> Vec<Document> {
    let mut latest: Vec<Document> = documents
        .into_iter()
        .rev()
        .unique_by(|document| document.id.clone())
        .collect();
    latest.reverse();
    latest
}

fn chunk_ids_of(snapshot: &IndexSnapshot, document_id: &str) -> Vec<ChunkId> {
    snapshot
        .live_positions_of(document_id)
        .into_iter()
        .filter_map(|position| snapshot.index.chunk_id(position).cloned())
        .collect()
}

fn append_chunks(snapshot: &mut IndexSnapshot, chunks: Vec<TextChunk>, vectors: Vec<Vec<f32>>) -> Result<()> {
    let ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();
    snapshot.index.add(vectors, ids)?;
    for chunk in chunks {
        snapshot.chunks.push(Arc::new(StoredChunk {
            chunk_id: chunk.chunk_id,
            text: chunk.text,
        }));
        snapshot.metadata.push(Arc::new(chunk.metadata));
    }
    Ok(())
}

fn join_hit(snapshot: &IndexSnapshot, hit: SearchHit) -> Option<RetrievedChunk> {
    let chunk = snapshot.chunks.get(hit.position)?;
    let metadata = snapshot.metadata.get(hit.position)?;
    Some(RetrievedChunk {
        chunk_id: chunk.chunk_id.clone(),
        text: chunk.text.clone(),
        score: hit.score,
        metadata: metadata.as_ref().clone(),
    })
}

/// Generations are strictly increasing and roughly track wall-clock time.
fn next_generation(previous: u64) -> u64 {
    let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
    now.max(previous + 1)
}
