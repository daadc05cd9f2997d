use clap::Parser;
use sift_ai_context::text::{SplitStrategy, SplitterConfig, TextSplitter};
use std::fs;
use std::io::{self, Read};
use std::process;

/// A CLI tool to split text files into JSON chunks using sift-ai-context.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Splitting strategy: characters, paragraphs or markdown.
    #[arg(short, long, default_value = "characters")]
    strategy: SplitStrategy,

    /// Maximum size of each chunk.
    #[arg(short = 'c', long, default_value_t = 1000)]
    chunk_size: usize,

    /// Characters shared between consecutive character windows.
    #[arg(short = 'o', long, default_value_t = 200)]
    chunk_overlap: usize,

    /// Paragraphs shorter than this are merged with the next one.
    #[arg(short, long, default_value_t = 50)]
    min_chunk_size: usize,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let config = SplitterConfig::new(args.strategy)
        .with_chunk_size(args.chunk_size)
        .with_chunk_overlap(args.chunk_overlap)
        .with_min_chunk_size(args.min_chunk_size);
    let splitter = TextSplitter::new(config)?;

    let chunks = splitter.split(&content);
    println!("{}", serde_json::to_string_pretty(&chunks)?);

    Ok(())
}
