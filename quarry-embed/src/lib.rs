//! # quarry-embed
//!
//! Text embedding providers for the quarry retrieval engine. Every backend sits
//! behind the async [`EmbeddingProvider`] trait so the engine can swap a local
//! model for a remote service without code changes.
//!
//! ## Providers
//!
//! - [`HashingEmbedProvider`]: deterministic signed feature hashing. No model,
//!   no network; used for tests and offline operation.
//! - [`HttpEmbedProvider`]: a remote sentence-embedding service speaking the
//!   OpenAI-compatible `/embeddings` protocol.
//! - `FastEmbedProvider`: local ONNX models, behind the `fastembed` feature.
//!
//! ## Quick Start
//!
//! ```no_run
//! use quarry_embed::{EmbedConfig, EmbeddingProvider, create_provider};
//!
//! # async fn example() -> quarry_embed::Result<()> {
//! let provider = create_provider(&EmbedConfig::hashing(384)).await?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}", result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`] type.
//! [`EmbedError::is_transient`] tells callers whether a failure (backend down,
//! request timed out) is worth retrying or falling back from.

pub mod config;
pub mod error;
pub mod hashing;
pub mod http;
#[cfg(feature = "fastembed")]
pub mod onnx;
pub mod provider;

// Re-export main types for easy access
pub use config::{API_KEY_ENV, EmbedConfig, ProviderKind};
pub use error::{EmbedError, Result};
pub use hashing::HashingEmbedProvider;
pub use http::HttpEmbedProvider;
#[cfg(feature = "fastembed")]
pub use onnx::FastEmbedProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, create_provider, normalize_l2};
