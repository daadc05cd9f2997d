use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use sift_ai_context::SplitStrategy;
use sift_ai_ingest::pipeline::ProcessingOutcome;
use sift_ai_ingest::{
    ChunkStore, Document, IngestConfig, IngestRuntime, ProcessorPreset, RegisterOptions,
    SqliteChunkStore,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Memory-aware document ingestion: chunk, embed and store documents in adaptive batches.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Treat this many megabytes as the memory ceiling
    #[arg(long)]
    memory_budget_mb: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chunk, embed and optionally store files
    Ingest {
        /// Files to ingest; each file becomes one document
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Split strategy (characters, paragraphs, markdown)
        #[arg(short, long)]
        strategy: Option<SplitStrategy>,
        /// Target chunk size in characters
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Overlap between character windows
        #[arg(long)]
        chunk_overlap: Option<usize>,
        /// SQLite database to store chunks in
        #[arg(long)]
        db: Option<PathBuf>,
        /// Processor preset (standard, large-documents, low-memory)
        #[arg(short, long)]
        preset: Option<ProcessorPreset>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Analyze current heap usage
    Memory {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show runtime status as JSON
    Status,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct IngestOutput<'a> {
    files: usize,
    #[serde(flatten)]
    outcome: &'a ProcessingOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    stored_total: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
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
        Some(path) => IngestConfig::load(path)?,
        None => IngestConfig::default(),
    };
    if args.memory_budget_mb.is_some() {
        config.probe.memory_budget_mb = args.memory_budget_mb;
    }

    match args.command {
        Commands::Ingest {
            files,
            strategy,
            chunk_size,
            chunk_overlap,
            db,
            preset,
            format,
        } => {
            if let Some(strategy) = strategy {
                config.processing.chunking.strategy = strategy;
            }
            if let Some(chunk_size) = chunk_size {
                config.processing.chunking.chunk_size = chunk_size;
            }
            if let Some(chunk_overlap) = chunk_overlap {
                config.processing.chunking.chunk_overlap = chunk_overlap;
            }
            if let Some(preset) = preset {
                config.preset = preset;
            }

            let runtime = IngestRuntime::from_system(config)?;
            runtime.start();

            let mut documents = Vec::with_capacity(files.len());
            for path in &files {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
                documents.push(
                    Document::new(content).with_metadata("source", path.display().to_string()),
                );
            }

            let store = match &db {
                Some(path) => {
                    let store = SqliteChunkStore::open(path).await?;
                    let connection = runtime.db().register_connection(
                        "chunks",
                        store.clone(),
                        RegisterOptions::new("sqlite").primary(),
                    )?;
                    Some((store, connection))
                }
                None => None,
            };

            let processor = runtime.processor();
            let sink = store
                .as_ref()
                .map(|(store, _)| Arc::new(store.clone()) as Arc<dyn ChunkStore>);
            let outcome = processor.process_documents(documents, sink).await?;

            let stored_total = match &store {
                Some((_, connection)) => connection
                    .execute("count_chunks", &json!({}))
                    .await?
                    .as_u64(),
                None => None,
            };
            runtime.shutdown().await;

            match format {
                OutputFormat::Json => {
                    let output = IngestOutput {
                        files: files.len(),
                        outcome: &ProcessingOutcome {
                            embeddings: None,
                            ..outcome.clone()
                        },
                        stored_total,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Summary => {
                    println!("Ingested {} files:", files.len());
                    println!("  Documents: {}", outcome.document_count);
                    println!("  Chunks: {}", outcome.chunk_count);
                    println!("  Embeddings: {}", outcome.embedding_count);
                    if outcome.degraded_embeddings > 0 {
                        println!("  Zero-filled embeddings: {}", outcome.degraded_embeddings);
                    }
                    println!("  Failed batches: {}", outcome.failed_batches);
                    println!(
                        "  Escalated to dynamic sizing: {}",
                        if outcome.escalated { "Yes" } else { "No" }
                    );
                    println!("  Elapsed: {} ms", outcome.elapsed_ms);
                    if let (Some(path), Some(total)) = (&db, stored_total) {
                        println!("  Stored in {}: {} chunks total", path.display(), total);
                    }
                }
            }
            info!(files = files.len(), "Ingestion finished");
            Ok(())
        }
        Commands::Memory { format } => {
            let runtime = IngestRuntime::from_system(config)?;
            runtime.memory().monitor_memory(false);
            let analysis = runtime.analyze_heap();

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&analysis)?);
                }
                OutputFormat::Summary => {
                    let usage = &analysis.usage;
                    println!("Heap analysis:");
                    println!("  Status: {:?}", analysis.status);
                    println!(
                        "  Heap used: {:.1} MB of {:.1} MB ({:.1}%)",
                        usage.heap_used_mb(),
                        usage.heap_total as f64 / (1024.0 * 1024.0),
                        usage.utilization_pct
                    );
                    println!("  Trend: {:?}", analysis.trend.trend);
                    if analysis.issues.is_empty() {
                        println!("  No issues found");
                    } else {
                        println!("  Issues:");
                        for issue in &analysis.issues {
                            println!("    [{:?}] {}", issue.severity, issue.message);
                        }
                    }
                    if !analysis.recommendations.is_empty() {
                        println!("  Recommendations:");
                        for recommendation in &analysis.recommendations {
                            println!("    - {recommendation}");
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Status => {
            let runtime = IngestRuntime::from_system(config)?;
            println!("{}", serde_json::to_string_pretty(&runtime.status())?);
            Ok(())
        }
    }
}
