//! Directory-backed artifact store with staged writes and ordered atomic renames

use super::codec;
use super::{ArtifactKind, ArtifactReport, ArtifactStore, FORMAT_VERSION, IndexConfig, IndexSnapshot};
use crate::error::{Result, RetrievalError};
use crate::retrieval::vector_index::FlatIndex;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Read size used when checksumming artifacts for health reports
const INSPECT_BLOCK: usize = 64 * 1024;

/// Stores the four index artifacts as files in one directory
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    fn staging_path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(format!("{}.tmp", kind.file_name()))
    }

    async fn read_artifact(&self, kind: ArtifactKind) -> Result<Vec<u8>> {
        match fs::read(self.path(kind)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RetrievalError::NotFound {
                path: self.dir.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn discard_staged(&self) {
        for kind in ArtifactKind::ALL {
            let _ = fs::remove_file(self.staging_path(kind)).await;
        }
    }

    async fn inspect_one(&self, kind: ArtifactKind) -> ArtifactReport {
        let path = self.path(kind);
        let mut report = ArtifactReport::missing(kind, path.clone());

        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                report.present = true;
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.present = true;

        let outcome = if kind == ArtifactKind::Config {
            inspect_config(&mut file, &mut report).await
        } else {
            inspect_binary(kind, &mut file, &mut report).await
        };
        if let Err(e) = outcome {
            report.error = Some(e.to_string());
        }
        report
    }
}

/// Config is a small JSON document, so it is read whole.
async fn inspect_config(file: &mut fs::File, report: &mut ArtifactReport) -> Result<()> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    report.size_bytes = Some(bytes.len() as u64);
    report.checksum = Some(blake3::hash(&bytes).to_hex().to_string());
    let config: IndexConfig = serde_json::from_slice(&bytes)?;
    report.generation = Some(config.generation);
    report.record_count = Some(config.num_chunks as u64);
    Ok(())
}

/// Verify a binary artifact by streaming it through the hasher in fixed-size
/// blocks; only the header and footer are held in memory.
async fn inspect_binary(kind: ArtifactKind, file: &mut fs::File, report: &mut ArtifactReport) -> Result<()> {
    let len = file.metadata().await?.len();
    report.size_bytes = Some(len);
    let framing = (codec::HEADER_LEN + codec::DIGEST_LEN) as u64;
    if len < framing {
        return Err(RetrievalError::corrupt(kind.file_name(), format!("truncated ({len} bytes)")));
    }

    let mut header = [0u8; codec::HEADER_LEN];
    file.read_exact(&mut header).await?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(&header);

    let mut remaining = len - framing;
    let mut block = vec![0u8; INSPECT_BLOCK];
    while remaining > 0 {
        let take = remaining.min(INSPECT_BLOCK as u64) as usize;
        file.read_exact(&mut block[..take]).await?;
        hasher.update(&block[..take]);
        remaining -= take as u64;
    }

    let mut footer = [0u8; codec::DIGEST_LEN];
    file.read_exact(&mut footer).await?;
    codec::verify_digest(kind, hasher.finalize(), &footer)?;

    let parsed = codec::parse_header(kind, &header, &footer)?;
    report.generation = Some(parsed.generation);
    report.record_count = Some(parsed.count);
    report.checksum = Some(parsed.checksum);
    Ok(())
}

/// Write `bytes` to `path` and flush them to stable storage.
async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Persist the directory entry updates made by renames.
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    if let Ok(handle) = fs::File::open(dir).await {
        if let Err(e) = handle.sync_all().await {
            debug!("Could not sync directory {}: {}", dir.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn save(&self, snapshot: &IndexSnapshot) -> Result<()> {
        snapshot.check_invariant()?;
        let generation = snapshot.config.generation;

        let artifacts = [
            (
                ArtifactKind::Index,
                codec::encode_index(&snapshot.index, generation),
            ),
            (
                ArtifactKind::Chunks,
                codec::encode_chunks(&snapshot.chunks, generation),
            ),
            (
                ArtifactKind::Metadata,
                codec::encode_metadata(&snapshot.metadata, generation)?,
            ),
            (
                ArtifactKind::Config,
                serde_json::to_vec_pretty(&snapshot.config)?,
            ),
        ];

        fs::create_dir_all(&self.dir).await?;

        // Stage all four before the first rename: a failed write leaves the previous generation whole.
        for (kind, bytes) in &artifacts {
            if let Err(e) = write_synced(&self.staging_path(*kind), bytes).await {
                warn!("Failed to stage {}: {}", kind, e);
                self.discard_staged().await;
                return Err(e);
            }
        }

        for (kind, _) in &artifacts {
            fs::rename(self.staging_path(*kind), self.path(*kind)).await?;
        }
        sync_dir(&self.dir).await;

        info!(
            "Saved index generation {} ({} rows, {} live) to {}",
            generation,
            snapshot.index.len(),
            snapshot.index.live_len(),
            self.dir.display()
        );
        Ok(())
    }

    async fn load(&self) -> Result<IndexSnapshot> {
        let config_bytes = self.read_artifact(ArtifactKind::Config).await?;
        let config: IndexConfig = serde_json::from_slice(&config_bytes)
            .map_err(|e| RetrievalError::corrupt(ArtifactKind::Config.file_name(), e.to_string()))?;
        if config.format_version != FORMAT_VERSION {
            return Err(RetrievalError::corrupt(
                ArtifactKind::Config.file_name(),
                format!("unsupported format version {}", config.format_version),
            ));
        }

        let (index_bytes, chunk_bytes, metadata_bytes) = futures::try_join!(
            self.read_artifact(ArtifactKind::Index),
            self.read_artifact(ArtifactKind::Chunks),
            self.read_artifact(ArtifactKind::Metadata),
        )?;

        let (index_header, vectors) = codec::decode_index(&index_bytes)?;
        let (chunks_header, chunks) = codec::decode_chunks(&chunk_bytes)?;
        let (metadata_header, metadata) = codec::decode_metadata(&metadata_bytes)?;

        for (kind, header) in [
            (ArtifactKind::Index, &index_header),
            (ArtifactKind::Chunks, &chunks_header),
            (ArtifactKind::Metadata, &metadata_header),
        ] {
            if header.generation != config.generation {
                return Err(RetrievalError::corrupt(
                    kind.file_name(),
                    format!(
                        "generation {} does not match config generation {} (interrupted write)",
                        header.generation, config.generation
                    ),
                ));
            }
        }

        if vectors.dimension != config.dimension {
            return Err(RetrievalError::corrupt(
                ArtifactKind::Index.file_name(),
                format!(
                    "dimension {} does not match config dimension {}",
                    vectors.dimension, config.dimension
                ),
            ));
        }

        let rows = index_header.count as usize;
        if rows != chunks.len() || rows != metadata.len() {
            return Err(RetrievalError::corrupt(
                ArtifactKind::Index.file_name(),
                format!(
                    "{} vectors, {} chunks, {} metadata records",
                    rows,
                    chunks.len(),
                    metadata.len()
                ),
            ));
        }

        let ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let index = FlatIndex::from_parts(vectors.dimension, vectors.data, ids, vectors.tombstones)
            .map_err(|e| RetrievalError::corrupt(ArtifactKind::Index.file_name(), e.to_string()))?;

        let snapshot = IndexSnapshot {
            index,
            chunks,
            metadata,
            config,
        };
        snapshot.check_invariant()?;

        info!(
            "Loaded index generation {} ({} live chunks) from {}",
            snapshot.config.generation,
            snapshot.index.live_len(),
            self.dir.display()
        );
        Ok(snapshot)
    }

    async fn exists(&self) -> bool {
        for kind in ArtifactKind::ALL {
            if fs::try_exists(self.path(kind)).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    async fn inspect(&self) -> Vec<ArtifactReport> {
        let mut reports = Vec::with_capacity(ArtifactKind::ALL.len());
        for kind in ArtifactKind::ALL {
            reports.push(self.inspect_one(kind).await);
        }
        reports
    }

    fn location(&self) -> &Path {
        &self.dir
    }
}
