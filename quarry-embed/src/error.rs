//! Error types for the embedding system

use std::time::Duration;

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
/// Used throughout the crate for operations that can fail.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Comprehensive error type for all embedding operations.
///
/// This enum covers every failure an embedding backend can report, from
/// configuration errors to an unreachable embedding service. Callers that need
/// to decide between retrying, degrading, and failing outright should use
/// [`EmbedError::is_transient`] rather than matching on individual variants.
///
/// # Error Categories
///
/// - **Configuration Errors**: Invalid provider settings
/// - **Availability Errors**: The backend cannot be reached or did not answer in time
/// - **Contract Errors**: The backend answered with vectors of the wrong shape
/// - **Runtime Errors**: Local model initialization or inference failures
/// - **IO Errors**: File system access issues
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when provider configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// The embedding backend could not be reached or refused service
    #[error("Embedding backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// The embedding backend did not answer within the allotted time
    #[error("Embedding request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The backend returned vectors of an unexpected dimension
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The backend answered with a payload that does not match the protocol
    #[error("Invalid response from embedding backend: {message}")]
    InvalidResponse { message: String },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error during embedding generation
    #[error("Embedding generation failed: {source}")]
    EmbeddingGeneration {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create a model initialization error from any error type.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Create an embedding generation error from any error type.
    pub fn embedding_gen<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::EmbeddingGeneration {
            source: Box::new(source),
        }
    }

    /// Create an invalid configuration error with a custom message.
    ///
    /// This is a convenience constructor for configuration validation errors,
    /// such as a missing endpoint or a zero dimension.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a backend-unavailable error with a custom message.
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Create an invalid-response error with a custom message.
    pub fn invalid_response<S: Into<String>>(message: S) -> Self {
        Self::InvalidResponse {
            message: message.into(),
        }
    }

    /// Whether the failure may clear up on its own (backend down or slow).
    ///
    /// Transient errors are worth retrying; everything else is a configuration
    /// or contract problem that retrying cannot fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. } | Self::Timeout { .. })
    }
}
