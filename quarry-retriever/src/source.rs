//! Document sources consumed by `build_index`.
//!
//! A source yields the full corpus each time it is asked; the engine decides what
//! to do with it. Three sources ship with the crate:
//!
//! - [`MemorySource`]: a fixed list of documents, mostly for tests and embedding
//! - [`JsonlSource`]: one JSON [`Document`] per line
//! - [`DirectorySource`]: every text file under a directory tree, honouring `.gitignore`

use crate::error::{Result, RetrievalError};
use async_trait::async_trait;
use quarry_context::Document;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where `build_index` gets its documents from
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Load every document in the corpus. Each returned document has been validated.
    async fn load_documents(&self) -> Result<Vec<Document>>;

    /// Short human-readable description, used in logs and statistics
    fn describe(&self) -> String;
}

/// Documents held in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    documents: Vec<Document>,
}

impl MemorySource {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn load_documents(&self) -> Result<Vec<Document>> {
        for document in &self.documents {
            document.validate()?;
        }
        Ok(self.documents.clone())
    }

    fn describe(&self) -> String {
        format!("memory ({} documents)", self.documents.len())
    }
}

/// A JSON Lines file, one document per non-blank line
#[derive(Debug, Clone)]
pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse JSONL content. Errors name the offending line.
    pub fn parse(content: &str, origin: &Path) -> Result<Vec<Document>> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                Document::from_json(line).map_err(|e| {
                    RetrievalError::source(format!("{}:{}: {}", origin.display(), number + 1, e))
                })
            })
            .collect()
    }
}

#[async_trait]
impl DocumentSource for JsonlSource {
    async fn load_documents(&self) -> Result<Vec<Document>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RetrievalError::source(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let documents = Self::parse(&content, &self.path)?;
        info!(
            "Read {} documents from {}",
            documents.len(),
            self.path.display()
        );
        Ok(documents)
    }

    fn describe(&self) -> String {
        format!("jsonl {}", self.path.display())
    }
}

/// Every text file under a directory. The document id is the path relative to the
/// root and the dataset is the name of the directory containing the file.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Whether a file looks like prose worth indexing
    pub fn is_text_file(path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with('.') {
                return false;
            }
        }
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => matches!(
                ext.to_ascii_lowercase().as_str(),
                "txt" | "md" | "markdown" | "rst" | "text" | "csv" | "html" | "htm" | "xml"
            ),
            None => path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| matches!(name, "README" | "NOTICE" | "LICENSE")),
        }
    }

    fn walk(root: &Path) -> Result<Vec<Document>> {
        let dataset_for_root = root
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let mut documents = Vec::new();
        for entry in ignore::Walk::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_some_and(|t| t.is_file()) || !Self::is_text_file(path) {
                continue;
            }

            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let relative = path.strip_prefix(root).unwrap_or(path);
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
                .replace('#', "%23");

            let dataset = relative
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .or_else(|| dataset_for_root.clone());

            let mut document = Document::new(id, text)
                .with_metadata("path", path.to_string_lossy().into_owned());
            document.source_dataset = dataset;
            document.validate()?;
            debug!("Loaded {}", document.id);
            documents.push(document);
        }

        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(documents)
    }
}

#[async_trait]
impl DocumentSource for DirectorySource {
    async fn load_documents(&self) -> Result<Vec<Document>> {
        if !self.root.is_dir() {
            return Err(RetrievalError::source(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        let root = self.root.clone();
        let documents = tokio::task::spawn_blocking(move || Self::walk(&root))
            .await
            .map_err(|e| RetrievalError::source(format!("directory walk panicked: {e}")))??;
        info!(
            "Read {} documents from {}",
            documents.len(),
            self.root.display()
        );
        Ok(documents)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// Pick a source for `path`: a directory walk for directories, JSONL otherwise.
pub fn open_source(path: impl Into<PathBuf>) -> std::sync::Arc<dyn DocumentSource> {
    let path = path.into();
    if path.is_dir() {
        std::sync::Arc::new(DirectorySource::new(path))
    } else {
        std::sync::Arc::new(JsonlSource::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_parse_reports_line_numbers() {
        let content = concat!(
            r#"{"id": "a", "text": "first"}"#,
            "\n\n",
            r#"{"id": "", "text": "blank id"}"#,
            "\n"
        );
        let err = JsonlSource::parse(content, Path::new("docs.jsonl")).unwrap_err();
        assert!(err.to_string().contains("docs.jsonl:3"), "{err}");
    }

    #[tokio::test]
    async fn test_jsonl_source_reads_documents() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("docs.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"id": "t-1", "text": "road resurfacing", "source_dataset": "tenders"}"#,
                "\n",
                r#"{"id": "t-2", "text": "school catering", "metadata": {"budget": 1200}}"#,
                "\n"
            ),
        )?;

        let documents = JsonlSource::new(&path).load_documents().await?;
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].source_dataset.as_deref(), Some("tenders"));
        assert_eq!(documents[1].source_dataset, None);
        assert_eq!(documents[1].metadata["budget"], serde_json::json!(1200));
        Ok(())
    }

    #[tokio::test]
    async fn test_directory_source_ids_and_datasets() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::create_dir_all(dir.path().join("tenders"))?;
        std::fs::write(dir.path().join("tenders/bridge #2.txt"), "bridge repair works")?;
        std::fs::write(dir.path().join("notes.md"), "general notes")?;
        std::fs::write(dir.path().join("logo.png"), [0u8, 1, 2])?;

        let documents = DirectorySource::new(dir.path()).load_documents().await?;
        let ids: Vec<&str> = documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["notes.md", "tenders/bridge %232.txt"]);
        assert_eq!(documents[1].source_dataset.as_deref(), Some("tenders"));
        assert!(documents[0].source_dataset.is_some());
        Ok(())
    }

    #[test]
    fn test_is_text_file() {
        assert!(DirectorySource::is_text_file(Path::new("a/README")));
        assert!(DirectorySource::is_text_file(Path::new("notes.MD")));
        assert!(!DirectorySource::is_text_file(Path::new(".env")));
        assert!(!DirectorySource::is_text_file(Path::new("archive.zip")));
    }

    #[tokio::test]
    async fn test_memory_source_validates() {
        let source = MemorySource::new(vec![Document::new("bad#id", "text")]);
        assert!(matches!(
            source.load_documents().await,
            Err(RetrievalError::InvalidDocument(_))
        ));
        assert_eq!(MemorySource::empty().describe(), "memory (0 documents)");
    }
}
