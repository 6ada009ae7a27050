//! quarry-retriever: semantic retrieval over a persisted flat vector index
//!
//! This crate builds an index from a [`DocumentSource`](source::DocumentSource),
//! keeps it on disk as a set of checksummed artifacts, and answers top-k queries.
//! When the embedding backend is down, queries degrade to lexical matching
//! instead of failing.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: the engine, the flat index, batch embedding, lexical fallback
//! - **[`storage`]**: the artifact format and the file-backed store
//! - **[`status`]**: health checks and index statistics
//! - **[`source`]**: JSONL, directory, and in-memory document sources
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_retriever::{EngineConfig, RetrievalEngine, source::JsonlSource};
//! use quarry_embed::HashingEmbedProvider;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = RetrievalEngine::new(
//!     EngineConfig::new(".quarry"),
//!     Arc::new(HashingEmbedProvider::new(384)),
//!     Arc::new(JsonlSource::new("documents.jsonl")),
//! )?;
//! engine.build_index(false).await?;
//!
//! for hit in engine.retrieve("bridge maintenance", 5).await?.results {
//!     println!("{:.3} {}", hit.score, hit.chunk_id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! DocumentSource → WordChunker → BatchEmbedder → FlatIndex → ArtifactStore
//!                                                    ↓
//!                  query → embed ──(backend down)──→ lexical
//! ```

pub mod config;
pub mod error;
pub mod retrieval;
pub mod source;
pub mod status;
pub mod storage;

pub use config::EngineConfig;
pub use error::{Result, RetrievalError};
pub use retrieval::{
    BuildOutcome, BuildPhase, BuildReport, BuildStatus, EngineState, RetrievalEngine, RetrievalMethod,
    RetrievalOptions, RetrievalResponse, RetrievedChunk,
};
pub use status::{HealthStatus, IndexHealth, IndexStatistics, StatusApi};
