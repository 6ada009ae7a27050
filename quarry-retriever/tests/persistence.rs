//! Persistence round-trips and the handling of damaged artifact sets.

mod common;

use anyhow::Result;
use common::*;
use quarry_embed::{EmbeddingProvider, HashingEmbedProvider};
use quarry_retriever::{
    BuildOutcome, EngineState, HealthStatus, RetrievalError,
    storage::{ArtifactKind, ArtifactStore, FileArtifactStore, codec},
};
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_save_load_search_is_bit_identical() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    engine.build_index(false).await?;
    let in_memory = engine.snapshot().await.unwrap();

    let query = HashingEmbedProvider::new(DIMENSION)
        .embed_text("drainage channels and road markings")
        .await?;
    let before = in_memory.index.search(&query, 4)?;

    let loaded = FileArtifactStore::new(dir.path()).load().await?;
    let after = loaded.index.search(&query, 4)?;

    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.position, b.position);
        assert_eq!(a.score.to_bits(), b.score.to_bits());
        assert_eq!(
            in_memory.chunks[a.position].chunk_id,
            loaded.chunks[b.position].chunk_id
        );
    }
    assert_eq!(loaded.config, in_memory.config);
    assert_eq!(loaded.metadata, in_memory.metadata);
    Ok(())
}

#[tokio::test]
async fn test_config_records_index_parameters() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    let report = engine.build_index(false).await?;

    let raw = std::fs::read_to_string(dir.path().join("config.json"))?;
    let config: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(config["model_name"], "hashing-v1");
    assert_eq!(config["chunk_size"], 6);
    assert_eq!(config["chunk_overlap"], 2);
    assert_eq!(config["dimension"], DIMENSION);
    assert_eq!(config["num_documents"], 5);
    assert_eq!(config["num_chunks"], report.chunks);
    assert_eq!(config["index_type"], "flat_ip");
    assert_eq!(config["generation"], report.generation);
    assert!(config["created_at"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_interrupted_swap_is_detected_not_repaired() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    engine.build_index(false).await?;
    let snapshot = engine.snapshot().await.unwrap();

    // A crash after the first rename: index.qvx is one generation ahead of the rest.
    let ahead = codec::encode_index(&snapshot.index, snapshot.config.generation + 1);
    std::fs::write(dir.path().join(ArtifactKind::Index.file_name()), ahead)?;

    let reopened = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    let err = reopened.load_index().await.unwrap_err();
    assert!(matches!(err, RetrievalError::CorruptArtifact { .. }), "{err}");
    assert_eq!(reopened.state(), EngineState::Failed);

    let health = reopened.get_health().await?;
    assert_eq!(health.overall_status, HealthStatus::Critical);
    assert!(health.issues.iter().any(|i| i.check == "generation_mismatch"));
    assert!(
        health
            .recommendations
            .iter()
            .any(|r| r.contains("resync metadata with vectors"))
    );

    // build_index(false) falls back to the full pipeline and leaves a consistent set.
    let report = reopened.build_index(false).await?;
    assert_eq!(report.outcome, BuildOutcome::Built);
    assert_eq!(reopened.state(), EngineState::Ready);
    assert!(reopened.get_health().await?.healthy);
    Ok(())
}

#[tokio::test]
async fn test_checksum_failure_is_corrupt_artifact() -> Result<()> {
    let dir = tempdir()?;
    engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus())
        .build_index(false)
        .await?;

    let path = dir.path().join(ArtifactKind::Metadata.file_name());
    let mut bytes = std::fs::read(&path)?;
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    std::fs::write(&path, bytes)?;

    let err = FileArtifactStore::new(dir.path()).load().await.unwrap_err();
    match err {
        RetrievalError::CorruptArtifact { artifact, .. } => assert_eq!(artifact, "metadata.qvx"),
        other => panic!("expected CorruptArtifact, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_directory_is_not_found() -> Result<()> {
    let dir = tempdir()?;
    let store = FileArtifactStore::new(dir.path().join("never-created"));
    assert!(!store.exists().await);
    assert!(matches!(store.load().await, Err(RetrievalError::NotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_tombstones_survive_reload_and_rebuild_compacts() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    engine.build_index(false).await?;
    engine.delete_documents(&["t-103".to_string()]).await?;

    let reopened = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    assert_eq!(reopened.build_index(false).await?.outcome, BuildOutcome::Loaded);
    let snapshot = reopened.snapshot().await.unwrap();
    assert!(snapshot.index.tombstone_count() > 0);
    assert!(snapshot.live_positions_of("t-103").is_empty());

    let response = reopened.retrieve("office furniture desks chairs", 10).await?;
    assert!(response.results.iter().all(|r| r.metadata.document_id != "t-103"));

    let rebuilt = reopened.build_index(true).await?;
    assert_eq!(rebuilt.outcome, BuildOutcome::Built);
    assert!(rebuilt.generation > snapshot.config.generation);
    let compacted = reopened.snapshot().await.unwrap();
    assert_eq!(compacted.index.tombstone_count(), 0);
    assert_eq!(compacted.index.len(), compacted.index.live_len());
    Ok(())
}

#[tokio::test]
async fn test_dimension_change_is_fatal_on_load() -> Result<()> {
    let dir = tempdir()?;
    engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus())
        .build_index(false)
        .await?;

    let narrower = engine_with(dir.path(), Arc::new(HashingEmbedProvider::new(64)), tender_corpus());
    let err = narrower.build_index(false).await.unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::DimensionMismatch {
            expected: DIMENSION,
            actual: 64
        }
    ));
    assert_eq!(narrower.state(), EngineState::Failed);

    // The persisted generation was not touched.
    let store = FileArtifactStore::new(dir.path());
    assert_eq!(store.load().await?.config.dimension, DIMENSION);

    // An explicit rebuild with the new model recovers.
    let report = narrower.build_index(true).await?;
    assert_eq!(report.outcome, BuildOutcome::Built);
    assert_eq!(store.load().await?.config.dimension, 64);
    assert_eq!(narrower.state(), EngineState::Ready);
    Ok(())
}

#[tokio::test]
async fn test_model_change_is_fatal_on_load() -> Result<()> {
    let dir = tempdir()?;
    engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus())
        .build_index(false)
        .await?;

    let renamed = engine_with(
        dir.path(),
        Arc::new(RenamedModelProvider::new("multilingual-e5-small")),
        tender_corpus(),
    );
    let err = renamed.build_index(false).await.unwrap_err();
    match &err {
        RetrievalError::ModelMismatch { persisted, configured } => {
            assert_eq!(persisted, "hashing-v1");
            assert_eq!(configured, "multilingual-e5-small");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(renamed.state(), EngineState::Failed);
    assert!(renamed.snapshot().await.is_none());
    assert!(matches!(
        renamed.load_index().await,
        Err(RetrievalError::ModelMismatch { .. })
    ));

    let health = renamed.get_health().await?;
    assert_eq!(health.overall_status, HealthStatus::Critical);
    assert!(health.issues.iter().any(|i| i.check == "engine_state"));

    // Queries stay empty instead of mixing two embedding spaces.
    assert!(renamed.retrieve("bridge deck", 3).await?.is_empty());

    let store = FileArtifactStore::new(dir.path());
    assert_eq!(store.load().await?.config.model_name, "hashing-v1");

    let report = renamed.build_index(true).await?;
    assert_eq!(report.outcome, BuildOutcome::Built);
    assert_eq!(store.load().await?.config.model_name, "multilingual-e5-small");
    assert_eq!(renamed.state(), EngineState::Ready);
    Ok(())
}

#[tokio::test]
async fn test_no_staging_files_left_behind() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    engine.build_index(false).await?;
    engine
        .add_documents(vec![quarry_context::Document::new("t-300", "Park bench repainting")])
        .await?;

    let mut names: Vec<String> = std::fs::read_dir(dir.path())?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<std::io::Result<_>>()?;
    names.sort();
    assert_eq!(
        names,
        vec!["chunks.qvx", "config.json", "index.qvx", "metadata.qvx"]
    );
    Ok(())
}
