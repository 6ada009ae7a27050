//! End-to-end behaviour of the retrieval engine against scripted embedding backends.

mod common;

use anyhow::Result;
use common::*;
use quarry_context::{ChunkId, Document, WordChunker};
use quarry_retriever::{
    BuildOutcome, EngineState, HealthStatus, RetrievalEngine, RetrievalError, RetrievalMethod, RetrievalOptions,
    source::{DirectorySource, MemorySource},
    storage::{ArtifactStore, FileArtifactStore},
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn assert_parallel_arrays(engine_snapshot: &quarry_retriever::storage::IndexSnapshot) {
    engine_snapshot.check_invariant().expect("invariant holds");
    assert_eq!(engine_snapshot.index.len(), engine_snapshot.chunks.len());
    assert_eq!(engine_snapshot.chunks.len(), engine_snapshot.metadata.len());
}

#[tokio::test]
async fn test_ranking_follows_cosine_similarity() -> Result<()> {
    let dir = tempdir()?;
    let provider = ScriptedProvider::new(
        3,
        [
            ("gamma report", vec![0.1, 0.994_987_4, 0.0]),
            ("beta report", vec![0.5, 0.866_025_4, 0.0]),
            ("alpha report", vec![0.9, 0.435_889_9, 0.0]),
            ("the query", vec![1.0, 0.0, 0.0]),
        ],
    );
    let documents = vec![
        Document::new("c", "gamma report"),
        Document::new("b", "beta report"),
        Document::new("a", "alpha report"),
    ];
    let engine = engine_with(dir.path(), Arc::new(provider), documents);
    engine.build_index(false).await?;

    let response = engine.retrieve("the query", 2).await?;
    assert_eq!(response.retrieval_method, RetrievalMethod::Semantic);
    let ids: Vec<&str> = response.results.iter().map(|r| r.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["a#0", "b#0"]);
    assert!((response.results[0].score - 0.9).abs() < 1e-4);
    assert!((response.results[1].score - 0.5).abs() < 1e-4);
    assert_eq!(response.results[0].text, "alpha report");
    Ok(())
}

#[tokio::test]
async fn test_short_document_is_one_chunk() -> Result<()> {
    let windows: Vec<_> = quarry_context::chunk("a b c", 5, 1)?.collect();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].text, "a b c");

    let dir = tempdir()?;
    let engine = RetrievalEngine::new(
        test_config(dir.path()).with_chunking(5, 1),
        Arc::new(CountingProvider::new()),
        Arc::new(MemorySource::new(vec![Document::new("abc", "a b c")])),
    )?;
    let report = engine.build_index(false).await?;
    assert_eq!(report.chunks, 1);

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.chunks[0].text, "a b c");
    assert_eq!(snapshot.metadata[0].total_chunks, 1);
    Ok(())
}

#[tokio::test]
async fn test_unbuilt_engine_answers_empty() -> Result<()> {
    let dir = tempdir()?;
    // Any embedding call would fail: the scripted provider knows no texts.
    let engine = engine_with(
        dir.path(),
        Arc::new(ScriptedProvider::new(3, [])),
        tender_corpus(),
    );

    assert_eq!(engine.state(), EngineState::Unbuilt);
    let response = engine.retrieve("bridge repair", 5).await?;
    assert!(response.is_empty());
    assert_eq!(response.query, "bridge repair");
    Ok(())
}

#[tokio::test]
async fn test_second_build_loads_instead_of_recomputing() -> Result<()> {
    let dir = tempdir()?;
    let first_provider = Arc::new(CountingProvider::new());
    let first = engine_with(dir.path(), first_provider.clone(), tender_corpus());

    let built = first.build_index(false).await?;
    assert_eq!(built.outcome, BuildOutcome::Built);
    assert_eq!(first_provider.texts_embedded(), built.chunks);
    let before = first.retrieve("bridge deck repair", 3).await?;

    let second_provider = Arc::new(CountingProvider::new());
    let second = engine_with(dir.path(), second_provider.clone(), tender_corpus());
    let loaded = second.build_index(false).await?;
    assert_eq!(loaded.outcome, BuildOutcome::Loaded);
    assert_eq!(loaded.generation, built.generation);
    assert_eq!(second_provider.texts_embedded(), 0);

    let after = second.retrieve("bridge deck repair", 3).await?;
    assert_eq!(before.results, after.results);
    assert_eq!(second_provider.texts_embedded(), 1);
    Ok(())
}

#[tokio::test]
async fn test_incremental_add_embeds_only_new_documents() -> Result<()> {
    let dir = tempdir()?;
    let provider = Arc::new(CountingProvider::new());
    let engine = engine_with(dir.path(), provider.clone(), tender_corpus());
    engine.build_index(false).await?;
    let live_before = engine.snapshot().await.unwrap().index.live_len();
    provider.reset();

    let new_documents = vec![
        Document::new("t-200", "Snow clearing of pedestrian streets during the winter season")
            .with_source_dataset("services"),
        Document::new("t-201", "Replacement of street lighting with LED fixtures").with_source_dataset("works"),
    ];
    let chunker = WordChunker::new(6, 2)?;
    let new_chunks: usize = new_documents
        .iter()
        .map(|d| chunker.chunk_document(d).len())
        .sum();

    let added = engine.add_documents(new_documents).await?;
    assert_eq!(added, 2);
    assert_eq!(provider.texts_embedded(), new_chunks);

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.index.live_len(), live_before + new_chunks);
    assert_eq!(snapshot.config.num_documents, 7);
    assert_parallel_arrays(&snapshot);

    let response = engine
        .retrieve_with("street lighting LED", RetrievalOptions::new(1).with_source_dataset("works"))
        .await?;
    assert_eq!(response.results[0].metadata.document_id, "t-201");
    Ok(())
}

#[tokio::test]
async fn test_invariant_holds_across_mutations() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());

    engine.build_index(false).await?;
    assert_parallel_arrays(&engine.snapshot().await.unwrap());

    engine
        .add_documents(vec![Document::new("t-102", "Catering replaced by vending machines")])
        .await?;
    let snapshot = engine.snapshot().await.unwrap();
    assert_parallel_arrays(&snapshot);
    assert_eq!(snapshot.live_positions_of("t-102").len(), 1);

    let removed = engine.delete_documents(&["t-100".to_string(), "t-999".to_string()]).await?;
    assert_eq!(removed, 1);
    let snapshot = engine.snapshot().await.unwrap();
    assert_parallel_arrays(&snapshot);
    assert!(snapshot.live_positions_of("t-100").is_empty());
    assert!(snapshot.index.position(&ChunkId::new("t-100", 0)).is_none());

    let response = engine.retrieve("northern ring road resurfacing", 10).await?;
    assert!(response.results.iter().all(|r| r.metadata.document_id != "t-100"));
    Ok(())
}

#[tokio::test]
async fn test_invalid_documents_rejected_before_embedding() -> Result<()> {
    let dir = tempdir()?;
    let provider = Arc::new(CountingProvider::new());
    let engine = engine_with(dir.path(), provider.clone(), tender_corpus());
    engine.build_index(false).await?;
    provider.reset();

    let err = engine
        .add_documents(vec![
            Document::new("fine", "valid text"),
            Document::new("bad#id", "reserved separator"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::InvalidDocument(_)));
    assert_eq!(provider.texts_embedded(), 0);
    Ok(())
}

#[tokio::test]
async fn test_backend_outage_falls_back_to_lexical() -> Result<()> {
    let dir = tempdir()?;
    let provider = Arc::new(SwitchableProvider::new());
    let engine = engine_with(dir.path(), provider.clone(), tender_corpus());
    engine.build_index(false).await?;

    provider.set_online(false);
    let response = engine.retrieve("river bridge expansion joints", 3).await?;
    assert_eq!(response.retrieval_method, RetrievalMethod::Lexical);
    assert_eq!(response.results[0].metadata.document_id, "t-101");
    assert!(response.results.iter().all(|r| r.score > 0.0 && r.score <= 1.0));

    let filtered = engine
        .retrieve_with(
            "river bridge expansion joints",
            RetrievalOptions::new(3).with_source_dataset("services"),
        )
        .await?;
    assert!(filtered.is_empty());

    // Index construction has no fallback.
    let err = engine.build_index(true).await.unwrap_err();
    assert!(matches!(err, RetrievalError::BackendUnavailable { .. }));
    assert_eq!(engine.state(), EngineState::Ready);

    provider.set_online(true);
    let response = engine.retrieve("river bridge expansion joints", 3).await?;
    assert_eq!(response.retrieval_method, RetrievalMethod::Semantic);
    Ok(())
}

#[tokio::test]
async fn test_embedding_timeout_falls_back_to_lexical() -> Result<()> {
    let dir = tempdir()?;
    engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus())
        .build_index(false)
        .await?;

    let config = test_config(dir.path())
        .with_embed_timeout(Duration::from_secs(1))
        .with_retries(0, Duration::from_millis(1));
    let engine = RetrievalEngine::new(
        config,
        Arc::new(SlowProvider::new(Duration::from_secs(5))),
        Arc::new(MemorySource::empty()),
    )?;
    engine.load_index().await?;

    let response = engine.retrieve("school catering lunches", 2).await?;
    assert_eq!(response.retrieval_method, RetrievalMethod::Lexical);
    assert_eq!(response.results[0].metadata.document_id, "t-102");
    Ok(())
}

#[tokio::test]
async fn test_embedding_timeout_fails_writes_and_keeps_generation() -> Result<()> {
    let dir = tempdir()?;
    let built = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus())
        .build_index(false)
        .await?;

    let config = test_config(dir.path())
        .with_embed_timeout(Duration::from_secs(1))
        .with_retries(0, Duration::from_millis(1));
    let engine = RetrievalEngine::new(
        config,
        Arc::new(SlowProvider::new(Duration::from_secs(5))),
        Arc::new(MemorySource::new(tender_corpus())),
    )?;
    engine.load_index().await?;
    assert_eq!(engine.state(), EngineState::Ready);

    // Index construction has no fallback for a slow backend.
    let err = engine.build_index(true).await.unwrap_err();
    assert!(matches!(err, RetrievalError::Timeout { .. }), "unexpected error: {err:?}");
    assert_eq!(engine.state(), EngineState::Ready);

    let err = engine
        .add_documents(vec![Document::new("t-500", "Replacement of street lighting columns")])
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::Timeout { .. }), "unexpected error: {err:?}");
    assert_eq!(engine.state(), EngineState::Ready);

    let snapshot = engine.snapshot().await.unwrap();
    assert_eq!(snapshot.config.generation, built.generation);
    assert!(snapshot.live_positions_of("t-500").is_empty());
    let on_disk = FileArtifactStore::new(dir.path()).load().await?;
    assert_eq!(on_disk.config.generation, built.generation);
    assert_eq!(on_disk.index.live_len(), built.chunks);

    // Reads still answer, lexically.
    let response = engine.retrieve("bridge deck", 1).await?;
    assert_eq!(response.retrieval_method, RetrievalMethod::Lexical);
    Ok(())
}

#[tokio::test]
async fn test_add_after_failed_build_makes_engine_ready() -> Result<()> {
    let dir = tempdir()?;
    let provider = Arc::new(SwitchableProvider::new());
    let engine = engine_with(dir.path(), provider.clone(), tender_corpus());

    provider.set_online(false);
    let err = engine.build_index(false).await.unwrap_err();
    assert!(matches!(err, RetrievalError::BackendUnavailable { .. }));
    assert_eq!(engine.state(), EngineState::Failed);

    provider.set_online(true);
    let added = engine
        .add_documents(vec![
            Document::new("t-600", "Repair of the harbour footbridge railings").with_source_dataset("works"),
        ])
        .await?;
    assert_eq!(added, 1);
    assert_eq!(engine.state(), EngineState::Ready);

    let health = engine.get_health().await?;
    assert_eq!(health.state, EngineState::Ready);
    assert!(health.issues.iter().all(|issue| issue.check != "engine_state"));
    assert_eq!(health.overall_status, HealthStatus::Healthy);

    let response = engine.retrieve("harbour footbridge", 1).await?;
    assert_eq!(response.retrieval_method, RetrievalMethod::Semantic);
    assert_eq!(response.results[0].metadata.document_id, "t-600");
    Ok(())
}

#[tokio::test]
async fn test_min_score_filter() -> Result<()> {
    let dir = tempdir()?;
    let engine = engine_with(dir.path(), Arc::new(CountingProvider::new()), tender_corpus());
    engine.build_index(false).await?;

    let everything = engine.retrieve("office furniture desks", 100).await?;
    let threshold = everything.results[0].score;
    let strict = engine
        .retrieve_with("office furniture desks", RetrievalOptions::new(100).with_min_score(threshold))
        .await?;
    assert!(!strict.is_empty());
    assert!(strict.len() < everything.len());
    assert!(strict.results.iter().all(|r| r.score >= threshold));
    Ok(())
}

#[tokio::test]
async fn test_build_from_directory_source() -> Result<()> {
    let corpus = tempdir()?;
    std::fs::create_dir_all(corpus.path().join("works"))?;
    std::fs::write(
        corpus.path().join("works/bridge.txt"),
        "Structural repair of the river bridge deck",
    )?;
    std::fs::write(
        corpus.path().join("works/roads.md"),
        "Resurfacing of the northern ring road",
    )?;

    let dir = tempdir()?;
    let engine = RetrievalEngine::new(
        test_config(dir.path()),
        Arc::new(CountingProvider::new()),
        Arc::new(DirectorySource::new(corpus.path())),
    )?;
    let report = engine.build_index(false).await?;
    assert_eq!(report.documents, 2);

    let response = engine.retrieve("river bridge deck", 1).await?;
    assert_eq!(response.results[0].metadata.document_id, "works/bridge.txt");
    assert_eq!(response.results[0].metadata.source_dataset.as_deref(), Some("works"));
    Ok(())
}
