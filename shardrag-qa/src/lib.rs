//! # shardrag-qa
//!
//! Question answering over a directory of vector shards. A question is
//! embedded, searched across every shard, merged into one ranked list, turned
//! into quoted context, and answered by a chat-completion model. The
//! orchestrator keeps the conversation history and running cost for the
//! session.
//!
//! ## Architecture
//!
//! The pipeline is assembled from the other workspace crates:
//! - `shardrag-embed` encodes queries
//! - `shardrag-retriever` discovers, searches and merges shards, and assembles context
//! - `shardrag-context` re-chunks source documents to recover passage text
//!
//! ## Quick Start
//!
//! ```no_run
//! use shardrag_qa::{QueryOptions, QueryOrchestrator, RagConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RagConfig::load(None)?;
//! let orchestrator = QueryOrchestrator::from_config(&config).await?;
//!
//! let turn = orchestrator
//!     .query("First-line treatment for stage 1 hypertension?", QueryOptions::default())
//!     .await;
//! println!("{}", turn.answer);
//! for citation in &turn.citations {
//!     println!("  {} ({})", citation.filename, citation.shard_id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See [`config`] for the TOML layout. `OPENAI_API_KEY` must be set in the
//! environment or in a `.env` file.

pub mod config;
pub mod error;
pub mod generation;
pub mod orchestrator;
pub mod session;

pub use config::{ModelPricing, RagConfig};
pub use error::{QaError, Result};
pub use generation::{ChatMessage, Generation, Generator, OpenAiGenerator, Role, TokenUsage};
pub use orchestrator::{NO_CONTEXT_ANSWER, QueryOptions, QueryOrchestrator, QueryPhase};
pub use session::{ConversationTurn, SessionState};
