use anyhow::Context;
use clap::{Parser, Subcommand};
use shardrag_embed::BackendPreference;
use shardrag_qa::{ConversationTurn, QueryOptions, QueryOrchestrator, RagConfig};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Ask questions against a directory of vector shards.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base directory containing the shard directories
    #[arg(short, long, global = true)]
    stores_base: Option<PathBuf>,

    /// Chat model used for answers
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Number of merged passages used as context
    #[arg(short = 'k', long, global = true)]
    top_k: Option<usize>,

    /// Results taken from each shard before merging
    #[arg(long, global = true)]
    per_shard_k: Option<usize>,

    /// Embedding backend: auto, neural or sparse
    #[arg(long, global = true)]
    backend: Option<BackendPreference>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer one question and exit
    Ask {
        /// The question
        question: String,
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Interactive session with conversation history
    Chat {
        /// Do not include previous turns in the context
        #[arg(long)]
        no_history: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

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

    let mut config = RagConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(stores_base) = args.stores_base {
        config.stores_base = stores_base;
    }
    if let Some(model) = args.model {
        config.generation.model = model;
    }
    if let Some(top_k) = args.top_k {
        config.retrieval.top_k = top_k;
    }
    if let Some(per_shard_k) = args.per_shard_k {
        config.retrieval.per_shard_k = per_shard_k;
    }
    if let Some(backend) = args.backend {
        config.embedding.backend = backend;
    }

    let orchestrator = QueryOrchestrator::from_config(&config)
        .await
        .context("Failed to initialize the question-answering pipeline")?;
    let options = QueryOptions::from_config(&config);

    match args.command {
        Commands::Ask { question, format } => {
            let turn = orchestrator.query(&question, options).await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&turn)?),
                OutputFormat::Text => print_turn(&turn),
            }
            Ok(())
        }
        Commands::Chat { no_history } => chat(&orchestrator, options.with_history(!no_history)).await,
    }
}

async fn chat(orchestrator: &QueryOrchestrator, options: QueryOptions) -> anyhow::Result<()> {
    println!("Model: {}", orchestrator.model());
    println!("Commands: /reset, /export <file>, /cost, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input.split_once(' ').unwrap_or((input, "")) {
            ("/quit" | "/exit", _) => break,
            ("/reset", _) => {
                orchestrator.reset().await;
                println!("Session reset.");
            }
            ("/cost", _) => {
                println!(
                    "Total cost: ${:.4} | Total tokens: {}",
                    orchestrator.total_cost().await,
                    orchestrator.total_tokens().await
                );
            }
            ("/export", file) => {
                let file = file.trim();
                if file.is_empty() {
                    println!("Usage: /export <file>");
                    continue;
                }
                match orchestrator.export_history(file).await {
                    Ok(()) => println!("Exported history to {file}"),
                    Err(e) => println!("Export failed: {e}"),
                }
            }
            _ => {
                let turn = orchestrator.query(input, options).await;
                print_turn(&turn);
            }
        }
    }

    println!(
        "\nSession total: ${:.4} over {} tokens",
        orchestrator.total_cost().await,
        orchestrator.total_tokens().await
    );
    Ok(())
}

fn print_turn(turn: &ConversationTurn) {
    println!("\n{}", turn.answer);

    if !turn.citations.is_empty() {
        println!("\nSources:");
        for (i, citation) in turn.citations.iter().enumerate() {
            println!(
                "  {}. {} (shard {}, score {:.3})",
                i + 1,
                citation.filename,
                citation.shard_id,
                citation.score
            );
        }
    }

    if !turn.followup_questions.is_empty() {
        println!("\nFollow-up questions:");
        for question in &turn.followup_questions {
            println!("  {question}");
        }
    }

    println!(
        "\n[{} context passage(s) | {} tokens | ${:.4}]",
        turn.num_contexts, turn.tokens, turn.cost
    );
}
