use clap::Parser;
use quarry_context::{Document, WordChunker};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};

/// A CLI tool to chunk a text file into JSON output using quarry-context.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Document id used to build chunk ids.
    #[arg(short, long, default_value = "stdin")]
    id: String,

    /// Dataset tag copied into every chunk's metadata.
    #[arg(short = 'D', long)]
    dataset: Option<String>,

    /// Number of words per chunk.
    #[arg(short = 's', long, default_value_t = 200)]
    chunk_size: usize,

    /// Number of words shared by consecutive chunks.
    #[arg(short, long, default_value_t = 50)]
    overlap: usize,
}

#[derive(Serialize)]
struct SerializableChunk<'a> {
    chunk_id: &'a str,
    token_count: usize,
    chunk_index: usize,
    total_chunks: usize,
    text: &'a str,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let text = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let mut document = Document::new(args.id, text);
    document.source_dataset = args.dataset;
    document.validate()?;

    let chunker = WordChunker::new(args.chunk_size, args.overlap)?;
    let chunks = chunker.chunk_document(&document);

    let serializable_chunks: Vec<SerializableChunk> = chunks
        .iter()
        .map(|c| SerializableChunk {
            chunk_id: c.chunk_id.as_str(),
            token_count: c.token_count,
            chunk_index: c.metadata.chunk_index,
            total_chunks: c.metadata.total_chunks,
            text: &c.text,
        })
        .collect();

    let json_output = serde_json::to_string_pretty(&serializable_chunks)?;
    println!("{json_output}");

    Ok(())
}
