//! Source documents as they cross the ingestion boundary.

use crate::text::CHUNK_ID_SEPARATOR;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Errors raised when a record fails validation at ingestion.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Document id must not be empty")]
    EmptyId,

    #[error("Document id '{id}' contains reserved character '#'")]
    ReservedCharacter { id: String },

    #[error("Malformed document record: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },
}

/// An external input record. Immutable once ingested; re-ingesting the same `id`
/// supersedes the earlier version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Source-system identifier
    pub id: String,
    /// Raw content
    pub text: String,
    /// Provenance tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dataset: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source_dataset: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_source_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.source_dataset = Some(dataset.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Parse and validate a single JSON record (one line of a JSONL file).
    pub fn from_json(record: &str) -> Result<Self, DocumentError> {
        let document: Document = serde_json::from_str(record)?;
        document.validate()?;
        Ok(document)
    }

    /// Check the invariants every ingested document must satisfy.
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.id.trim().is_empty() {
            return Err(DocumentError::EmptyId);
        }
        if self.id.contains(CHUNK_ID_SEPARATOR) {
            return Err(DocumentError::ReservedCharacter {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}
