//! Embed a few sentences and rank them against a query.
//!
//! Uses the local hashing provider by default. Point it at an embedding service with
//! `QUARRY_EMBED_ENDPOINT=http://localhost:8080/v1 cargo run --example simple_embedding`.

use quarry_embed::{EmbedConfig, EmbeddingProvider, create_provider};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::var("QUARRY_EMBED_ENDPOINT") {
        Ok(endpoint) => EmbedConfig::http(endpoint, "all-MiniLM-L6-v2", 384),
        Err(_) => EmbedConfig::hashing(384),
    }
    .with_batch_size(2);

    println!("Provider: {} ({})", config.provider, config.model_name);
    let provider = create_provider(&config).await?;
    provider.health_check().await?;

    let texts = vec![
        "Rust is a systems programming language.".to_string(),
        "The council approved the road resurfacing budget.".to_string(),
        "Memory safety without garbage collection.".to_string(),
    ];
    let result = provider.embed_texts(&texts).await?;
    println!("Generated {} embeddings of dimension {}", result.len(), result.dimension);

    let query = provider.embed_text("safe systems programming").await?;
    let mut scored: Vec<(f32, &String)> = result
        .embeddings
        .iter()
        .zip(&texts)
        .map(|(e, t)| (e.iter().zip(&query).map(|(a, b)| a * b).sum(), t))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    for (score, text) in scored {
        println!("{score:.3}  {text}");
    }
    Ok(())
}
