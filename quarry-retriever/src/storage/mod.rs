//! Persistence for the index aggregate.
//!
//! An index generation is four artifacts that are only meaningful together:
//!
//! ```text
//! index.qvx     normalized vectors + tombstones       (position-addressed)
//! chunks.qvx    chunk id + chunk text per position
//! metadata.qvx  ChunkMetadata (JSON) per position
//! config.json   IndexConfig: model, chunking, dimension, generation, ...
//! ```
//!
//! Every binary artifact is stamped with the generation recorded in `config.json`,
//! so a crash between renames leaves a detectable mix of generations. Detection is
//! reported, never repaired: `load` fails with `CorruptArtifact` and the health
//! check recommends a rebuild.

use crate::error::{Result, RetrievalError};
use crate::retrieval::vector_index::{FLAT_INNER_PRODUCT, FlatIndex};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_context::{ChunkId, ChunkMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod codec;
pub mod file_store;

pub use file_store::FileArtifactStore;

/// Version of the on-disk artifact format
pub const FORMAT_VERSION: u32 = 1;

/// Persisted description of an index generation (`config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub model_name: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub dimension: usize,
    pub num_documents: usize,
    pub num_chunks: usize,
    pub index_type: String,
    pub created_at: DateTime<Utc>,
    pub generation: u64,
    pub format_version: u32,
}

impl IndexConfig {
    pub fn new(model_name: impl Into<String>, chunk_size: usize, chunk_overlap: usize, dimension: usize) -> Self {
        Self {
            model_name: model_name.into(),
            chunk_size,
            chunk_overlap,
            dimension,
            num_documents: 0,
            num_chunks: 0,
            index_type: FLAT_INNER_PRODUCT.to_string(),
            created_at: Utc::now(),
            generation: 0,
            format_version: FORMAT_VERSION,
        }
    }
}

/// Text of one chunk, stored at the same position as its vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk_id: ChunkId,
    pub text: String,
}

/// The unit of persistence: vectors, chunk texts, and metadata in parallel arrays.
///
/// Records are reference-counted and the index shares its vector segments, so a
/// clone taken to prepare the next generation does not copy the stored data.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    pub index: FlatIndex,
    pub chunks: Vec<Arc<StoredChunk>>,
    pub metadata: Vec<Arc<ChunkMetadata>>,
    pub config: IndexConfig,
}

impl IndexSnapshot {
    pub fn empty(config: IndexConfig) -> Result<Self> {
        Ok(Self {
            index: FlatIndex::new(config.dimension)?,
            chunks: Vec::new(),
            metadata: Vec::new(),
            config,
        })
    }

    /// `len(vectors) == len(chunks) == len(metadata)`, with matching chunk ids.
    pub fn check_invariant(&self) -> Result<()> {
        let (vectors, chunks, metadata) = (self.index.len(), self.chunks.len(), self.metadata.len());
        if vectors != chunks || chunks != metadata {
            return Err(RetrievalError::corrupt(
                "index",
                format!("{vectors} vectors, {chunks} chunks, {metadata} metadata records"),
            ));
        }
        if let Some((position, chunk)) = self
            .chunks
            .iter()
            .enumerate()
            .find(|(position, chunk)| self.index.chunk_id(*position) != Some(&chunk.chunk_id))
        {
            return Err(RetrievalError::corrupt(
                "chunks",
                format!("chunk {} is not the chunk indexed at position {position}", chunk.chunk_id),
            ));
        }
        if self.index.dimension() != self.config.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.config.dimension,
                actual: self.index.dimension(),
            });
        }
        Ok(())
    }

    /// Live positions whose chunks belong to `document_id`
    pub fn live_positions_of(&self, document_id: &str) -> Vec<usize> {
        self.metadata
            .iter()
            .enumerate()
            .filter(|(position, meta)| meta.document_id == document_id && self.index.is_live(*position))
            .map(|(position, _)| position)
            .collect()
    }

    /// Distinct documents with at least one live chunk
    pub fn live_document_count(&self) -> usize {
        self.metadata
            .iter()
            .enumerate()
            .filter(|(position, _)| self.index.is_live(*position))
            .map(|(_, meta)| meta.document_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Refresh the counters in `config` after a mutation.
    pub fn refresh_counts(&mut self) {
        self.config.num_documents = self.live_document_count();
        self.config.num_chunks = self.index.live_len();
    }

    pub fn memory_bytes(&self) -> usize {
        self.index.memory_bytes()
            + self
                .chunks
                .iter()
                .map(|c| c.text.len() + c.chunk_id.as_str().len())
                .sum::<usize>()
            + self.metadata.len() * std::mem::size_of::<ChunkMetadata>()
    }
}

/// Which of the four artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Index,
    Chunks,
    Metadata,
    Config,
}

impl ArtifactKind {
    /// All artifacts, in the order they are swapped into place
    pub const ALL: [ArtifactKind; 4] = [Self::Index, Self::Chunks, Self::Metadata, Self::Config];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Index => "index.qvx",
            Self::Chunks => "chunks.qvx",
            Self::Metadata => "metadata.qvx",
            Self::Config => "config.json",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

/// What a store found on disk for one artifact, without loading the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub present: bool,
    pub size_bytes: Option<u64>,
    pub record_count: Option<u64>,
    pub generation: Option<u64>,
    /// Hex blake3 digest recorded in the artifact footer
    pub checksum: Option<String>,
    /// Why the artifact could not be read, if it could not
    pub error: Option<String>,
}

impl ArtifactReport {
    pub fn missing(kind: ArtifactKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            present: false,
            size_bytes: None,
            record_count: None,
            generation: None,
            checksum: None,
            error: None,
        }
    }
}

/// Durable storage for index snapshots
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Atomically replace the persisted generation with `snapshot`.
    async fn save(&self, snapshot: &IndexSnapshot) -> Result<()>;

    /// Load the persisted generation.
    ///
    /// # Errors
    /// - [`RetrievalError::NotFound`] when no complete artifact set exists
    /// - [`RetrievalError::CorruptArtifact`] when an artifact exists but fails its
    ///   checksum, version, generation, or shape checks
    async fn load(&self) -> Result<IndexSnapshot>;

    /// Whether any artifact of a persisted index is present
    async fn exists(&self) -> bool;

    /// Per-artifact presence and header information, for health checks
    async fn inspect(&self) -> Vec<ArtifactReport>;

    /// Where the artifacts live
    fn location(&self) -> &Path;
}
