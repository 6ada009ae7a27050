//! Word-window chunking for retrieval.
//!
//! Documents are split on whitespace-delimited word boundaries into windows of
//! `chunk_size` words. Consecutive windows share `overlap` words, so the window
//! start advances by `chunk_size - overlap` words per step.
//!
//! The module defines three main pieces:
//! - [`WordChunker`]: validated chunking parameters.
//! - [`WordWindows`]: a lazy, restartable iterator of [`WordWindow`]s borrowed from the
//!   source text. Cloning the iterator restarts nothing and costs nothing; each clone
//!   continues independently from the same position.
//! - [`TextChunk`]: an owned chunk with its composite [`ChunkId`] and [`ChunkMetadata`],
//!   produced by [`WordChunker::chunk_document`].
//!
//! Window text is always a substring of the input: inner whitespace is preserved as-is
//! and nothing is padded.
//!
//! ```
//! use quarry_context::text::WordChunker;
//!
//! let chunker = WordChunker::new(3, 1).unwrap();
//! let windows: Vec<_> = chunker.windows("one two  three four five").collect();
//!
//! assert_eq!(windows.len(), 2);
//! assert_eq!(windows[0].text, "one two  three");
//! assert_eq!(windows[1].text, "three four five");
//! ```
use crate::document::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Separator between the document id and the sequence number in a [`ChunkId`].
pub const CHUNK_ID_SEPARATOR: char = '#';

/// Errors raised while configuring a chunker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Chunking parameters that can never produce a valid window sequence
    #[error("Invalid chunking configuration: {message}")]
    InvalidConfig { message: String },
}

/// Composite chunk identifier: `"{document_id}#{chunk_index}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(document_id: &str, chunk_index: usize) -> Self {
        Self(format!("{document_id}{CHUNK_ID_SEPARATOR}{chunk_index}"))
    }

    /// Split the id back into `(document_id, chunk_index)`.
    ///
    /// Returns `None` for strings that were not produced by [`ChunkId::new`].
    pub fn parse(&self) -> Option<(&str, usize)> {
        let (document_id, index) = self.0.rsplit_once(CHUNK_ID_SEPARATOR)?;
        let index = index.parse().ok()?;
        Some((document_id, index))
    }

    /// The parent document id, or the whole id if it is not composite.
    pub fn document_id(&self) -> &str {
        self.parse().map(|(doc, _)| doc).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChunkId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Per-chunk metadata: the parent document's provenance plus the chunk's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dataset: Option<String>,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Metadata copied verbatim from the parent document
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// An owned chunk derived from a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub chunk_id: ChunkId,
    pub text: String,
    /// Number of whitespace-delimited words in `text`
    pub token_count: usize,
    pub metadata: ChunkMetadata,
}

/// A window of words borrowed from the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordWindow<'a> {
    /// Zero-based position of this window in the sequence
    pub sequence: usize,
    /// Byte range of the window in the source text
    pub range: Range<usize>,
    pub text: &'a str,
    pub word_count: usize,
}

/// Validated word-window chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordChunker {
    chunk_size: usize,
    overlap: usize,
}

impl WordChunker {
    /// Create a chunker producing windows of `chunk_size` words that share `overlap` words.
    ///
    /// # Errors
    /// [`ChunkError::InvalidConfig`] when `chunk_size` is zero or `overlap >= chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, ChunkError> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidConfig {
                message: "chunk_size must be at least 1".to_string(),
            });
        }
        if overlap >= chunk_size {
            return Err(ChunkError::InvalidConfig {
                message: format!(
                    "chunk_overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
                ),
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Number of words the window start advances per step.
    pub fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }

    /// Lazily iterate over the word windows of `text`.
    pub fn windows<'a>(&self, text: &'a str) -> WordWindows<'a> {
        WordWindows {
            text,
            chunker: *self,
            cursor: 0,
            sequence: 0,
            done: false,
        }
    }

    /// Chunk a document into owned [`TextChunk`]s with ids and metadata.
    ///
    /// An empty (or whitespace-only) document produces no chunks.
    pub fn chunk_document(&self, document: &Document) -> Vec<TextChunk> {
        let windows: Vec<WordWindow<'_>> = self.windows(&document.text).collect();
        let total_chunks = windows.len();

        let chunks: Vec<TextChunk> = windows
            .into_iter()
            .map(|window| TextChunk {
                chunk_id: ChunkId::new(&document.id, window.sequence),
                text: window.text.to_string(),
                token_count: window.word_count,
                metadata: ChunkMetadata {
                    document_id: document.id.clone(),
                    source_dataset: document.source_dataset.clone(),
                    chunk_index: window.sequence,
                    total_chunks,
                    extra: document.metadata.clone(),
                },
            })
            .collect();

        tracing::debug!(
            "Chunked document {} into {} chunks (size: {}, overlap: {})",
            document.id,
            chunks.len(),
            self.chunk_size,
            self.overlap
        );

        chunks
    }
}

/// Lazy iterator over the word windows of a text. See module docs for details.
#[derive(Debug, Clone)]
pub struct WordWindows<'a> {
    text: &'a str,
    chunker: WordChunker,
    /// Byte offset where the next window's first word search begins
    cursor: usize,
    sequence: usize,
    done: bool,
}

impl<'a> Iterator for WordWindows<'a> {
    type Item = WordWindow<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let step = self.chunker.step();
        let mut position = self.cursor;
        let mut first_start = None;
        let mut last_end = 0;
        let mut next_cursor = None;
        let mut word_count = 0;

        while word_count < self.chunker.chunk_size {
            let Some((start, end)) = next_word(self.text, position) else {
                break;
            };
            if word_count == 0 {
                first_start = Some(start);
            }
            if word_count == step {
                next_cursor = Some(start);
            }
            last_end = end;
            position = end;
            word_count += 1;
        }

        let Some(first_start) = first_start else {
            self.done = true;
            return None;
        };

        // Stop once the window ran out of words or nothing follows it.
        match next_word(self.text, last_end) {
            Some((following_start, _)) if word_count == self.chunker.chunk_size => {
                // With zero overlap the next window starts right after this one.
                self.cursor = next_cursor.unwrap_or(following_start);
            }
            _ => self.done = true,
        }

        let window = WordWindow {
            sequence: self.sequence,
            range: first_start..last_end,
            text: &self.text[first_start..last_end],
            word_count,
        };
        self.sequence += 1;
        Some(window)
    }
}

impl std::iter::FusedIterator for WordWindows<'_> {}

/// Find the byte span of the next whitespace-delimited word at or after `from`.
fn next_word(text: &str, from: usize) -> Option<(usize, usize)> {
    let rest = &text[from..];
    let start = from + rest.find(|c: char| !c.is_whitespace())?;
    let end = text[start..]
        .find(char::is_whitespace)
        .map(|offset| start + offset)
        .unwrap_or(text.len());
    Some((start, end))
}

/// Count whitespace-delimited words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Chunk `text` into word windows. See [`WordChunker`] for the windowing rules.
///
/// # Errors
/// [`ChunkError::InvalidConfig`] when `overlap >= chunk_size` or `chunk_size == 0`.
///
/// ```
/// let windows: Vec<_> = quarry_context::chunk("a b c", 5, 1).unwrap().collect();
/// assert_eq!(windows.len(), 1);
/// assert_eq!(windows[0].text, "a b c");
/// ```
pub fn chunk(text: &str, chunk_size: usize, overlap: usize) -> Result<WordWindows<'_>, ChunkError> {
    Ok(WordChunker::new(chunk_size, overlap)?.windows(text))
}
