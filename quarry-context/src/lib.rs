pub mod document;
pub mod text;

// Re-export the main chunking entry points for external use
pub use document::{Document, DocumentError};
pub use text::{
    ChunkError, ChunkId, ChunkMetadata, TextChunk, WordChunker, WordWindow, WordWindows, chunk,
};
