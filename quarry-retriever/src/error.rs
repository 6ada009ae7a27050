//! Error taxonomy for the retrieval engine

use quarry_context::{ChunkError, DocumentError};
use quarry_embed::EmbedError;
use std::path::PathBuf;
use std::time::Duration;

/// Result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors surfaced by the index, its persistence layer, and the engine.
///
/// Configuration, dimension and model errors are always surfaced to the caller.
/// [`BackendUnavailable`](Self::BackendUnavailable) and [`Timeout`](Self::Timeout)
/// are transient: batch embedding retries them, and `retrieve` degrades to lexical
/// matching on the first one.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Bad chunking, batching, or query parameters. Rejected before any I/O.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid document: {0}")]
    InvalidDocument(#[from] DocumentError),

    /// Embedding and index dimensions disagree
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The persisted index was embedded with a different model than the provider's
    #[error("Model mismatch: index was built with '{persisted}', provider is '{configured}'")]
    ModelMismatch { persisted: String, configured: String },

    /// A vector that cannot be stored (NaN or infinite entries)
    #[error("Invalid vector for {chunk_id}: {reason}")]
    InvalidVector { chunk_id: String, reason: String },

    /// A persisted artifact exists but cannot be trusted
    #[error("Corrupt artifact {artifact}: {reason}")]
    CorruptArtifact { artifact: String, reason: String },

    /// No persisted index exists at the configured location
    #[error("No persisted index found in {}", path.display())]
    NotFound { path: PathBuf },

    /// The engine has no loaded index but one exists on disk
    #[error("Index is not loaded; run build_index first")]
    IndexNotReady,

    #[error("Embedding backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Embedding request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// A build was requested while another one is in flight
    #[error("An index build is already running")]
    ConcurrentBuildRejected,

    #[error("Index build was cancelled")]
    Cancelled,

    /// Any other embedding failure
    #[error("Embedding failed: {0}")]
    Embedding(EmbedError),

    #[error("Document source failed: {message}")]
    Source { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RetrievalError {
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn corrupt<A: Into<String>, R: Into<String>>(artifact: A, reason: R) -> Self {
        Self::CorruptArtifact {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }

    pub fn source<S: Into<String>>(message: S) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    /// The persisted index cannot serve this engine at all; only a forced rebuild helps.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. } | Self::ModelMismatch { .. }
        )
    }

    /// Backend down or slow: worth retrying, and the trigger for lexical fallback.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Timeout { .. }
        )
    }
}

impl From<EmbedError> for RetrievalError {
    fn from(error: EmbedError) -> Self {
        match error {
            EmbedError::BackendUnavailable { message } => Self::BackendUnavailable { message },
            EmbedError::Timeout { timeout } => Self::Timeout { timeout },
            EmbedError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            EmbedError::InvalidConfig { message } => Self::InvalidConfig { message },
            other => Self::Embedding(other),
        }
    }
}

impl From<ChunkError> for RetrievalError {
    fn from(error: ChunkError) -> Self {
        match error {
            ChunkError::InvalidConfig { message } => Self::InvalidConfig { message },
        }
    }
}
