//! End-to-end question answering over a set of shards.
//!
//! Each call to [`QueryOrchestrator::query`] walks one state machine:
//!
//! ```text
//! Idle → Retrieving ─┬─ NoContext (terminal)
//!                    └─ ContextBuilt → Generating → Completed
//! ```
//!
//! Every path ends with exactly one turn appended to the session history.
//! Failures after startup never escape `query`: an empty retrieval becomes a
//! fixed answer (noting any shards that failed), a failed generation becomes an
//! error-description answer that still gets follow-ups, and a failed follow-up
//! call becomes an empty follow-up list.

use crate::config::RagConfig;
use crate::error::Result;
use crate::generation::{
    Generator, OpenAiGenerator, answer_messages, followup_messages, parse_followups,
};
use crate::session::{ConversationTurn, SessionState};
use chrono::Utc;
use serde::Serialize;
use shardrag_embed::{Embedder, EmbeddingAgent};
use shardrag_retriever::{
    AgentEmbedderFactory, ContextAssembler, RetrievalMerger, ShardDiscovery,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Answer recorded when retrieval finds nothing.
pub const NO_CONTEXT_ANSWER: &str = "No relevant context found in the knowledge base.";

/// The no-context answer, noting how many shards could not be searched.
fn no_context_answer(failed: usize, total: usize) -> String {
    format!("{NO_CONTEXT_ANSWER} ({failed} of {total} shards could not be searched)")
}

/// Stages of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Idle,
    Retrieving,
    NoContext,
    ContextBuilt,
    Generating,
    Completed,
}

impl QueryPhase {
    pub fn can_advance_to(self, next: QueryPhase) -> bool {
        use QueryPhase::*;
        matches!(
            (self, next),
            (Idle, Retrieving)
                | (Retrieving, NoContext)
                | (Retrieving, ContextBuilt)
                | (ContextBuilt, Generating)
                | (Generating, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueryPhase::NoContext | QueryPhase::Completed)
    }
}

struct PhaseTracker {
    phase: QueryPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: QueryPhase::Idle,
        }
    }

    fn advance(&mut self, next: QueryPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!("Query phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }
}

/// Per-query knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub top_k: usize,
    pub per_shard_k: usize,
    /// Prepend a summary of the last few turns to the context
    pub include_history: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            per_shard_k: 10,
            include_history: false,
        }
    }
}

impl QueryOptions {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            per_shard_k: config.retrieval.per_shard_k,
            include_history: false,
        }
    }

    /// Set history inclusion (builder style)
    pub fn with_history(self, include_history: bool) -> Self {
        Self {
            include_history,
            ..self
        }
    }
}

#[derive(Serialize)]
struct SessionExport<'a> {
    conversation_history: &'a [ConversationTurn],
    total_cost: f64,
    total_tokens: u64,
    model: &'a str,
    stores_base: &'a Path,
}

/// Drives retrieval, context assembly and generation, and owns the session.
///
/// `query` takes `&self`; session updates are serialized behind a mutex, so
/// one orchestrator can be shared through an `Arc`.
pub struct QueryOrchestrator {
    merger: RetrievalMerger,
    assembler: ContextAssembler,
    generator: Arc<dyn Generator>,
    system_prompt: String,
    stores_base: PathBuf,
    session: Mutex<SessionState>,
}

impl QueryOrchestrator {
    pub fn new(
        merger: RetrievalMerger,
        assembler: ContextAssembler,
        generator: Arc<dyn Generator>,
        system_prompt: impl Into<String>,
        stores_base: impl Into<PathBuf>,
    ) -> Self {
        Self {
            merger,
            assembler,
            generator,
            system_prompt: system_prompt.into(),
            stores_base: stores_base.into(),
            session: Mutex::new(SessionState::new()),
        }
    }

    /// Builds the full pipeline from configuration with the OpenAI-compatible
    /// generator. Fails with [`QaError::Configuration`](crate::QaError::Configuration) when the API key is
    /// missing or no embedding backend can be initialized.
    pub async fn from_config(config: &RagConfig) -> Result<Self> {
        config.validate()?;
        let api_key = config.require_api_key()?;
        let generator = OpenAiGenerator::new(&config.generation, api_key)?;
        Self::with_generator(config, Arc::new(generator)).await
    }

    /// Builds the pipeline from configuration around an existing generator.
    pub async fn with_generator(config: &RagConfig, generator: Arc<dyn Generator>) -> Result<Self> {
        config.validate()?;
        let agent = EmbeddingAgent::initialize(&config.embed_config()).await?;
        info!("Embedding queries with {}", agent.name());

        let shards = ShardDiscovery::new(&config.stores_base).discover();
        if shards.is_empty() {
            warn!("No shards found under {}", config.stores_base.display());
        } else {
            info!(
                "Discovered {} shard(s) under {}",
                shards.len(),
                config.stores_base.display()
            );
        }

        let merger = RetrievalMerger::new(shards, Arc::new(AgentEmbedderFactory::new(agent)))
            .with_deadline(config.query_deadline());
        let assembler = ContextAssembler::from_fs(config.chunker());

        Ok(Self::new(
            merger,
            assembler,
            generator,
            config.generation.system_prompt.clone(),
            config.stores_base.clone(),
        ))
    }

    pub fn merger(&self) -> &RetrievalMerger {
        &self.merger
    }

    pub fn model(&self) -> &str {
        self.generator.model()
    }

    /// Answers `question` and appends the resulting turn to the history.
    pub async fn query(&self, question: &str, options: QueryOptions) -> ConversationTurn {
        let mut tracker = PhaseTracker::new();
        info!("Query: {}", question);

        tracker.advance(QueryPhase::Retrieving);
        let retrieval = self
            .merger
            .retrieve(question, options.top_k, options.per_shard_k)
            .await;

        if retrieval.candidates.is_empty() {
            tracker.advance(QueryPhase::NoContext);
            let failed = retrieval.failed_shards().count();
            let answer = if failed > 0 {
                warn!(
                    "No context retrieved; {} of {} shard(s) failed",
                    failed,
                    retrieval.reports.len()
                );
                no_context_answer(failed, retrieval.reports.len())
            } else {
                info!("No relevant context found");
                NO_CONTEXT_ANSWER.to_string()
            };
            let turn = ConversationTurn {
                question: question.to_string(),
                answer,
                citations: Vec::new(),
                followup_questions: Vec::new(),
                cost: 0.0,
                tokens: 0,
                timestamp: Utc::now(),
                num_contexts: 0,
            };
            self.session.lock().await.push_turn(turn.clone());
            return turn;
        }

        let assembled = self.assembler.assemble(&retrieval.candidates);
        let context = if options.include_history {
            let prefix = self.session.lock().await.history_prefix();
            format!("{prefix}{}", assembled.text)
        } else {
            assembled.text.clone()
        };
        tracker.advance(QueryPhase::ContextBuilt);
        debug!(
            "Context built from {} passage(s), {} citation(s)",
            assembled.passages.len(),
            assembled.citations.len()
        );

        tracker.advance(QueryPhase::Generating);
        let messages = answer_messages(&self.system_prompt, &context, question);
        let (answer, cost, tokens, followup_questions) =
            match self.generator.complete(&messages).await {
                Ok(generation) => {
                    self.session
                        .lock()
                        .await
                        .add_usage(generation.cost, generation.usage.total_tokens);
                    let followups = self
                        .followups(question, &generation.text, &assembled.text)
                        .await;
                    (
                        generation.text,
                        generation.cost,
                        generation.usage.total_tokens,
                        followups,
                    )
                }
                Err(e) => {
                    error!("Answer generation failed: {}", e);
                    let answer = format!("An error occurred while generating the answer: {e}");
                    let followups = self.followups(question, &answer, &assembled.text).await;
                    (answer, 0.0, 0, followups)
                }
            };

        let turn = ConversationTurn {
            question: question.to_string(),
            answer,
            citations: assembled.citations,
            followup_questions,
            cost,
            tokens,
            timestamp: Utc::now(),
            num_contexts: retrieval.candidates.len(),
        };
        self.session.lock().await.push_turn(turn.clone());
        tracker.advance(QueryPhase::Completed);
        info!("Answered with {} citation(s), cost ${:.4}", turn.citations.len(), cost);
        turn
    }

    /// Up to three follow-up questions; usage counts toward the session totals only.
    async fn followups(&self, question: &str, answer: &str, context: &str) -> Vec<String> {
        let messages = followup_messages(question, answer, context);
        match self.generator.complete(&messages).await {
            Ok(generation) => {
                self.session
                    .lock()
                    .await
                    .add_usage(generation.cost, generation.usage.total_tokens);
                parse_followups(&generation.text)
            }
            Err(e) => {
                warn!("Follow-up generation failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.session.lock().await.history().to_vec()
    }

    pub async fn clear_history(&self) {
        self.session.lock().await.clear_history();
    }

    /// Clears history and zeroes the cost and token counters.
    pub async fn reset(&self) {
        self.session.lock().await.reset();
    }

    pub async fn total_cost(&self) -> f64 {
        self.session.lock().await.total_cost()
    }

    pub async fn total_tokens(&self) -> u64 {
        self.session.lock().await.total_tokens()
    }

    /// Writes the history and totals to `path` as pretty JSON.
    pub async fn export_history(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = {
            let session = self.session.lock().await;
            serde_json::to_string_pretty(&SessionExport {
                conversation_history: session.history(),
                total_cost: session.total_cost(),
                total_tokens: session.total_tokens(),
                model: self.generator.model(),
                stores_base: &self.stores_base,
            })?
        };
        tokio::fs::write(path, json).await?;
        info!("Exported conversation history to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use QueryPhase::*;
        assert!(Idle.can_advance_to(Retrieving));
        assert!(Retrieving.can_advance_to(NoContext));
        assert!(Retrieving.can_advance_to(ContextBuilt));
        assert!(ContextBuilt.can_advance_to(Generating));
        assert!(Generating.can_advance_to(Completed));

        assert!(!Idle.can_advance_to(Generating));
        assert!(!NoContext.can_advance_to(Generating));
        assert!(!Completed.can_advance_to(Retrieving));
        assert!(NoContext.is_terminal());
        assert!(Completed.is_terminal());
        assert!(!Generating.is_terminal());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = RagConfig::default();
        config.retrieval.top_k = 4;
        config.retrieval.per_shard_k = 2;
        let options = QueryOptions::from_config(&config).with_history(true);
        assert_eq!(
            options,
            QueryOptions {
                top_k: 4,
                per_shard_k: 2,
                include_history: true
            }
        );
    }

    #[test]
    fn test_no_context_answer_names_failed_shards() {
        let answer = no_context_answer(2, 3);
        assert!(answer.starts_with(NO_CONTEXT_ANSWER));
        assert!(answer.ends_with("(2 of 3 shards could not be searched)"));
    }
}
