use clap::{Parser, Subcommand};
use quarry_embed::create_provider;
use quarry_retriever::{
    EngineConfig, IndexHealth, IndexStatistics, RetrievalEngine, RetrievalOptions, RetrievalResponse,
    source::{DocumentSource, JsonlSource, MemorySource, open_source},
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Build, query, and inspect a quarry retrieval index.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the index artifacts (overrides the configuration)
    #[arg(short, long)]
    index_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the persisted index, or build it from a document source
    Build {
        /// JSONL file or directory of text files
        #[arg(short, long)]
        source: PathBuf,
        /// Rebuild even if a valid index exists
        #[arg(long)]
        force: bool,
    },
    /// Add or replace documents from a JSONL file without a full rebuild
    Add {
        /// JSONL file, one document per line
        path: PathBuf,
    },
    /// Retrieve the chunks most similar to a query
    Search {
        query: String,
        /// Number of results (defaults to the configured top-k)
        #[arg(short)]
        k: Option<usize>,
        /// Drop results scoring below this value
        #[arg(long)]
        min_score: Option<f32>,
        /// Only search chunks from this dataset
        #[arg(long)]
        dataset: Option<String>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Delete documents by id
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show index statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Run health checks
    Health {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default().with_env_overrides(),
    };
    if let Some(dir) = args.index_dir {
        config = config.with_index_dir(dir);
    }
    config.validate()?;

    match args.command {
        Commands::Build { source, force } => {
            let engine = Arc::new(open_engine(config, open_source(source)).await?);

            let canceller = {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted; cancelling build at the next batch boundary");
                        engine.cancel_build();
                    }
                })
            };
            let result = engine.build_index(force).await;
            canceller.abort();

            let report = result?;
            println!(
                "{:?} index generation {}: {} documents, {} chunks ({} ms)",
                report.outcome, report.generation, report.documents, report.chunks, report.elapsed_ms
            );
            Ok(())
        }
        Commands::Add { path } => {
            let documents = JsonlSource::new(&path).load_documents().await?;
            let engine = open_engine(config, Arc::new(MemorySource::empty())).await?;
            load_existing(&engine).await?;

            let added = engine.add_documents(documents).await?;
            println!("Added {added} documents from {}", path.display());
            Ok(())
        }
        Commands::Search {
            query,
            k,
            min_score,
            dataset,
            format,
        } => {
            let top_k = k.unwrap_or(config.default_top_k);
            let engine = open_engine(config, Arc::new(MemorySource::empty())).await?;
            load_existing(&engine).await?;

            let mut options = RetrievalOptions::new(top_k);
            if let Some(min_score) = min_score {
                options = options.with_min_score(min_score);
            }
            if let Some(dataset) = dataset {
                options = options.with_source_dataset(dataset);
            }

            let response = engine.retrieve_with(&query, options).await?;
            print_response(&response, &format)
        }
        Commands::Delete { ids } => {
            let engine = open_engine(config, Arc::new(MemorySource::empty())).await?;
            load_existing(&engine).await?;

            let removed = engine.delete_documents(&ids).await?;
            println!("Deleted {removed} of {} documents", ids.len());
            Ok(())
        }
        Commands::Stats { format } => {
            let engine = open_engine(config, Arc::new(MemorySource::empty())).await?;
            if let Err(e) = load_existing(&engine).await {
                warn!("Persisted index could not be loaded: {}", e);
            }
            let stats = engine.get_statistics().await?;
            print_statistics(&stats, &format)
        }
        Commands::Health { format } => {
            let engine = open_engine(config, Arc::new(MemorySource::empty())).await?;
            if let Err(e) = load_existing(&engine).await {
                warn!("Persisted index could not be loaded: {}", e);
            }
            let health = engine.get_health().await?;
            print_health(&health, &format)
        }
    }
}

async fn open_engine(config: EngineConfig, source: Arc<dyn DocumentSource>) -> anyhow::Result<RetrievalEngine> {
    let provider = create_provider(&config.embed).await?;
    info!(
        "Using {} embeddings ({}, {} dimensions)",
        provider.provider_name(),
        provider.model_name(),
        provider.embedding_dimension()
    );
    Ok(RetrievalEngine::new(config, provider, source)?)
}

/// Load the persisted index if there is one. Never builds.
async fn load_existing(engine: &RetrievalEngine) -> anyhow::Result<()> {
    if engine.store().exists().await {
        engine.load_index().await?;
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        format!("{}...", flat.chars().take(max_chars).collect::<String>())
    }
}

fn print_response(response: &RetrievalResponse, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
        OutputFormat::Summary => {
            println!(
                "Found {} results ({} retrieval):",
                response.len(),
                response.retrieval_method
            );
            for (rank, hit) in response.results.iter().enumerate() {
                println!(
                    "  {}. [{:.4}] {} | {}",
                    rank + 1,
                    hit.score,
                    hit.chunk_id,
                    preview(&hit.text, 80)
                );
            }
        }
        OutputFormat::Full => {
            println!("Retrieval method: {}", response.retrieval_method);
            for hit in &response.results {
                println!("Chunk: {}", hit.chunk_id);
                println!("Score: {:.6}", hit.score);
                println!("Document: {}", hit.metadata.document_id);
                if let Some(dataset) = &hit.metadata.source_dataset {
                    println!("Dataset: {dataset}");
                }
                println!(
                    "Position: {} of {}",
                    hit.metadata.chunk_index + 1,
                    hit.metadata.total_chunks
                );
                println!("Text:\n{}", hit.text);
                println!("{}", "-".repeat(60));
            }
        }
    }
    Ok(())
}

fn print_statistics(stats: &IndexStatistics, format: &OutputFormat) -> anyhow::Result<()> {
    if *format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("Index: {} ({})", stats.index_dir.display(), stats.state);
    println!("  Documents: {}", stats.total_documents);
    println!(
        "  Chunks: {} live, {} deleted, {} total",
        stats.live_chunks, stats.tombstoned_chunks, stats.total_chunks
    );
    println!(
        "  Model: {} via {} ({} dimensions)",
        stats.model_name, stats.provider_name, stats.dimension
    );
    println!("  Chunking: {} words, {} overlap", stats.chunk_size, stats.chunk_overlap);
    if let Some(generation) = stats.generation {
        println!("  Generation: {generation}");
    }
    if let Some(created_at) = stats.created_at {
        println!("  Created: {}", created_at.to_rfc3339());
    }
    if let Some(disk_bytes) = stats.disk_bytes {
        println!("  On disk: {disk_bytes} bytes");
    }
    if *format == OutputFormat::Full {
        println!("  In memory: ~{} bytes", stats.memory_bytes);
        for (dataset, chunks) in &stats.chunks_by_dataset {
            println!("  Dataset {dataset}: {chunks} chunks");
        }
        println!("  Last build: {:?}", stats.last_build.phase);
        if let Some(error) = &stats.last_build.error {
            println!("  Last build error: {error}");
        }
    }
    Ok(())
}

fn print_health(health: &IndexHealth, format: &OutputFormat) -> anyhow::Result<()> {
    if *format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(health)?);
        return Ok(());
    }

    println!("Health: {:?} (engine {})", health.overall_status, health.state);
    println!(
        "  Embedding backend: {}",
        if health.embedding_backend_reachable {
            "reachable"
        } else {
            "unreachable"
        }
    );
    for issue in &health.issues {
        println!("  [{:?}] {}: {}", issue.severity, issue.check, issue.message);
    }
    if !health.recommendations.is_empty() {
        println!("Recommendations:");
        for recommendation in &health.recommendations {
            println!("  - {recommendation}");
        }
    }
    if *format == OutputFormat::Full {
        println!("Artifacts:");
        for artifact in &health.artifacts {
            let detail = match (&artifact.error, artifact.generation) {
                (Some(error), _) => format!("error: {error}"),
                (None, Some(generation)) => format!(
                    "generation {generation}, {} records",
                    artifact.record_count.unwrap_or(0)
                ),
                (None, None) => "missing".to_string(),
            };
            println!("  {}: {}", artifact.kind, detail);
        }
    }
    Ok(())
}
