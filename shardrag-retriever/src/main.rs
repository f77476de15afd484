use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use shardrag_context::DocumentChunker;
use shardrag_context::text::{DEFAULT_CHUNK_CHARS, DEFAULT_OVERLAP_CHARS};
use shardrag_embed::{BackendPreference, EmbedConfig, Embedder, EmbeddingAgent};
use shardrag_retriever::{
    AgentEmbedderFactory, Citation, ContextAssembler, RetrievalCandidate, RetrievalMerger,
    ShardDiscovery, ShardIndex, ShardOutcome,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A CLI tool to inspect and search a directory of vector shards.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory containing the shard directories
    #[arg(short, long, default_value = "vector_stores")]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List discovered shards with their vector counts
    Shards {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Search all shards and print the merged results
    Search {
        /// The query text
        query: String,
        /// Number of merged results
        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,
        /// Results taken from each shard before merging
        #[arg(long, default_value_t = 10)]
        per_shard_k: usize,
        /// Embedding backend: auto, neural or sparse
        #[arg(long, default_value = "auto")]
        backend: BackendPreference,
        /// Neural embedding model name
        #[arg(long, default_value = "all-MiniLM-L6-v2")]
        model: String,
        /// Chunk length used when the shards were built
        #[arg(long, default_value_t = DEFAULT_CHUNK_CHARS)]
        chunk_chars: usize,
        /// Chunk overlap used when the shards were built
        #[arg(long, default_value_t = DEFAULT_OVERLAP_CHARS)]
        overlap_chars: usize,
        /// Give up on shards that have not answered after this many seconds
        #[arg(long, default_value_t = 60)]
        deadline_secs: u64,
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

#[derive(Serialize)]
struct ShardOutput {
    id: String,
    path: String,
    vectors: Option<usize>,
    dimension: Option<usize>,
    error: Option<String>,
}

#[derive(Serialize)]
struct HitOutput<'a> {
    rank: usize,
    #[serde(flatten)]
    candidate: &'a RetrievalCandidate,
    text: Option<&'a str>,
}

#[derive(Serialize)]
struct ShardOutcomeOutput {
    shard: String,
    hits: Option<usize>,
    error: Option<String>,
}

#[derive(Serialize)]
struct SearchOutput<'a> {
    query: &'a str,
    embedder: &'a str,
    hits: Vec<HitOutput<'a>>,
    citations: &'a [Citation],
    shards: Vec<ShardOutcomeOutput>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let shards = ShardDiscovery::new(&args.base_dir).discover();

    match args.command {
        Commands::Shards { format } => {
            let outputs: Vec<ShardOutput> = shards
                .iter()
                .map(|shard| match ShardIndex::load(&shard.path) {
                    Ok(index) => ShardOutput {
                        id: shard.id.clone(),
                        path: shard.path.display().to_string(),
                        vectors: Some(index.len()),
                        dimension: Some(index.dimension()),
                        error: None,
                    },
                    Err(e) => ShardOutput {
                        id: shard.id.clone(),
                        path: shard.path.display().to_string(),
                        vectors: None,
                        dimension: None,
                        error: Some(e.to_string()),
                    },
                })
                .collect();

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&outputs)?);
                }
                OutputFormat::Summary | OutputFormat::Full => {
                    println!(
                        "Found {} shard(s) under {}:",
                        outputs.len(),
                        args.base_dir.display()
                    );
                    for shard in outputs {
                        match (shard.vectors, shard.dimension, shard.error) {
                            (Some(vectors), Some(dimension), _) => println!(
                                "  {} | Vectors: {} | Dimension: {} | {}",
                                shard.id, vectors, dimension, shard.path
                            ),
                            (_, _, error) => println!(
                                "  {} | Unreadable: {} | {}",
                                shard.id,
                                error.unwrap_or_default(),
                                shard.path
                            ),
                        }
                    }
                }
            }
            Ok(())
        }
        Commands::Search {
            query,
            top_k,
            per_shard_k,
            backend,
            model,
            chunk_chars,
            overlap_chars,
            deadline_secs,
            format,
        } => {
            let chunker = DocumentChunker::checked(chunk_chars, overlap_chars)
                .map_err(|e| anyhow::anyhow!("Invalid chunking parameters: {e}"))?;
            let config = EmbedConfig::new(model).with_backend(backend);
            let agent = EmbeddingAgent::initialize(&config)
                .await
                .context("Failed to initialize the embedding backend")?;
            let embedder_name = agent.name().to_string();

            let merger = RetrievalMerger::new(shards, Arc::new(AgentEmbedderFactory::new(agent)))
                .with_deadline(Duration::from_secs(deadline_secs));
            let retrieval = merger.retrieve(&query, top_k, per_shard_k).await;

            let assembler = ContextAssembler::from_fs(chunker);
            let context = assembler.assemble(&retrieval.candidates);

            match format {
                OutputFormat::Json => {
                    let output = SearchOutput {
                        query: &query,
                        embedder: &embedder_name,
                        hits: retrieval
                            .candidates
                            .iter()
                            .zip(&context.passages)
                            .enumerate()
                            .map(|(i, (candidate, passage))| HitOutput {
                                rank: i + 1,
                                candidate,
                                text: passage.text(),
                            })
                            .collect(),
                        citations: &context.citations,
                        shards: retrieval
                            .reports
                            .iter()
                            .map(|report| match &report.outcome {
                                ShardOutcome::Searched { hits } => ShardOutcomeOutput {
                                    shard: report.shard.id.clone(),
                                    hits: Some(*hits),
                                    error: None,
                                },
                                ShardOutcome::Failed { error } => ShardOutcomeOutput {
                                    shard: report.shard.id.clone(),
                                    hits: None,
                                    error: Some(error.to_string()),
                                },
                            })
                            .collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Summary => {
                    println!(
                        "Found {} result(s) using {}:",
                        retrieval.candidates.len(),
                        embedder_name
                    );
                    for (i, candidate) in retrieval.candidates.iter().enumerate() {
                        println!(
                            "  {:>2}. Score: {:.3} | Shard: {} | Source: {} | Chunk: {}",
                            i + 1,
                            candidate.score,
                            candidate.shard_id,
                            candidate.metadata.source.as_deref().unwrap_or("Unknown"),
                            candidate.metadata.chunk_index
                        );
                    }
                    for report in retrieval.failed_shards() {
                        if let ShardOutcome::Failed { error } = &report.outcome {
                            println!("  Skipped shard {}: {}", report.shard.id, error);
                        }
                    }
                }
                OutputFormat::Full => {
                    println!("{}", context.text);
                    println!("\nCitations:");
                    for citation in &context.citations {
                        println!(
                            "  {} (shard {}, score {:.3})",
                            citation.filename, citation.shard_id, citation.score
                        );
                    }
                }
            }
            Ok(())
        }
    }
}
