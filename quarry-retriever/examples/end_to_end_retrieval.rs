//! Build an index from a handful of tenders, query it, delete a document, and
//! report statistics and health.
//!
//! ```sh
//! cargo run -p quarry-retriever --example end_to_end_retrieval
//! ```

use quarry_context::Document;
use quarry_embed::HashingEmbedProvider;
use quarry_retriever::{EngineConfig, RetrievalEngine, RetrievalOptions, source::MemorySource};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let index_dir = tempfile::tempdir()?;
    let documents = vec![
        Document::new("t-1", "Resurfacing of the northern ring road and drainage channels")
            .with_source_dataset("works"),
        Document::new("t-2", "Structural repair of the river bridge deck").with_source_dataset("works"),
        Document::new("t-3", "School catering services providing hot lunches").with_source_dataset("services"),
        Document::new("t-4", "Weekly cleaning of municipal libraries and sports centres")
            .with_source_dataset("services"),
    ];

    let engine = RetrievalEngine::new(
        EngineConfig::new(index_dir.path()).with_chunking(8, 2),
        Arc::new(HashingEmbedProvider::new(384)),
        Arc::new(MemorySource::new(documents)),
    )?;

    let report = engine.build_index(false).await?;
    println!(
        "{:?} generation {} with {} chunks in {} ms",
        report.outcome, report.generation, report.chunks, report.elapsed_ms
    );

    for query in ["bridge repair", "cleaning of libraries"] {
        let response = engine.retrieve(query, 2).await?;
        println!("\n{query} ({} retrieval)", response.retrieval_method);
        for hit in &response.results {
            println!("  {:.3} {} {}", hit.score, hit.chunk_id, hit.text);
        }
    }

    let services = engine
        .retrieve_with("lunches", RetrievalOptions::new(3).with_source_dataset("services"))
        .await?;
    println!("\nservices only: {} results", services.len());

    engine.delete_documents(&["t-2".to_string()]).await?;
    let stats = engine.get_statistics().await?;
    println!(
        "\nafter delete: {} documents, {} live chunks, {} tombstoned",
        stats.total_documents, stats.live_chunks, stats.tombstoned_chunks
    );

    let health = engine.get_health().await?;
    println!("health: {:?}", health.overall_status);
    Ok(())
}
