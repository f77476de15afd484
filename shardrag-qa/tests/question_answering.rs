//! End-to-end query behaviour with a scripted generator

use anyhow::Result;
use async_trait::async_trait;
use shardrag_context::DocumentChunker;
use shardrag_embed::{BackendPreference, Embedder};
use shardrag_qa::{
    ChatMessage, Generation, Generator, NO_CONTEXT_ANSWER, QaError, QueryOptions,
    QueryOrchestrator, RagConfig, TokenUsage,
};
use shardrag_retriever::{
    ContextAssembler, MetadataRecord, RetrievalMerger, SharedEmbedder, ShardDiscovery, ShardIndex,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

/// Returns queued responses in order and records every request.
#[derive(Default)]
struct ScriptedGenerator {
    responses: Mutex<VecDeque<shardrag_qa::Result<Generation>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    fn new(responses: Vec<shardrag_qa::Result<Generation>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, messages: &[ChatMessage]) -> shardrag_qa::Result<Generation> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(QaError::generation("no scripted response left")))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

fn generation(text: &str, cost: f64, tokens: u64) -> shardrag_qa::Result<Generation> {
    Ok(Generation {
        text: text.to_string(),
        usage: TokenUsage {
            prompt_tokens: tokens,
            completion_tokens: 0,
            total_tokens: tokens,
        },
        cost,
    })
}

struct FixedEmbedder(Vec<f32>);

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed_texts(
        &self,
        texts: &[String],
        _batch_size: usize,
    ) -> shardrag_embed::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| self.0.clone()).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.0.len())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

const PASSAGE: &str = "ACE inhibitors are first-line therapy for stage 1 hypertension.";

fn build_guideline_shard(base: &Path) -> Result<()> {
    let mut index = ShardIndex::open(base.join("cardiology"), 3)?;
    index.add(
        &[vec![1.0, 0.0, 0.0]],
        vec![MetadataRecord::new("guidelines/htn-2024.pdf", 0).with_text(PASSAGE)],
    )?;
    index.save()?;
    Ok(())
}

fn orchestrator(base: &Path, generator: Arc<dyn Generator>) -> QueryOrchestrator {
    orchestrator_with_query(base, generator, vec![1.0, 0.0, 0.0])
}

fn orchestrator_with_query(
    base: &Path,
    generator: Arc<dyn Generator>,
    query_vector: Vec<f32>,
) -> QueryOrchestrator {
    let merger = RetrievalMerger::new(
        ShardDiscovery::new(base).discover(),
        Arc::new(SharedEmbedder(Arc::new(FixedEmbedder(query_vector)))),
    );
    QueryOrchestrator::new(
        merger,
        ContextAssembler::from_fs(DocumentChunker::default()),
        generator,
        "Answer from the guidelines.\n\nContext:\n{context}",
        base,
    )
}

#[tokio::test]
async fn test_empty_base_path_answers_without_context() -> Result<()> {
    let dir = tempdir()?;
    let mut config = RagConfig::default();
    config.stores_base = dir.path().to_path_buf();
    config.embedding.backend = BackendPreference::Sparse;

    let generator = ScriptedGenerator::new(Vec::new());
    let orchestrator = QueryOrchestrator::with_generator(&config, generator.clone()).await?;

    let turn = orchestrator
        .query("What is the target blood pressure?", QueryOptions::default())
        .await;

    assert_eq!(turn.answer, NO_CONTEXT_ANSWER);
    assert!(turn.citations.is_empty());
    assert!(turn.followup_questions.is_empty());
    assert_eq!(turn.cost, 0.0);
    assert_eq!(turn.tokens, 0);
    assert_eq!(turn.num_contexts, 0);
    assert!(generator.requests().is_empty());

    let history = orchestrator.history().await;
    assert_eq!(history, vec![turn]);
    assert_eq!(orchestrator.total_cost().await, 0.0);
    Ok(())
}

#[tokio::test]
async fn test_missing_api_key_is_fatal() {
    let config = RagConfig::default();
    assert!(config.api_key.is_none());
    let err = QueryOrchestrator::from_config(&config).await.err();
    assert!(matches!(err, Some(QaError::Configuration { .. })));
}

#[tokio::test]
async fn test_generation_failure_becomes_answer() -> Result<()> {
    let dir = tempdir()?;
    build_guideline_shard(dir.path())?;

    let generator = ScriptedGenerator::new(vec![
        Err(QaError::Status {
            status: 503,
            body: "overloaded".to_string(),
        }),
        generation("1. Is there an alternative?\n2. When to retry?", 0.002, 20),
    ]);
    let orchestrator = orchestrator(dir.path(), generator.clone());

    let turn = orchestrator
        .query("First-line therapy?", QueryOptions::default())
        .await;

    let expected =
        "An error occurred while generating the answer: Generation endpoint returned 503: overloaded";
    assert_eq!(turn.answer, expected);
    assert_eq!(turn.cost, 0.0);
    assert_eq!(turn.tokens, 0);
    assert_eq!(
        turn.followup_questions,
        vec!["1. Is there an alternative?", "2. When to retry?"]
    );
    assert_eq!(turn.num_contexts, 1);
    assert_eq!(turn.citations.len(), 1);

    // follow-ups are still requested, with the error text as the answer
    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1][0].content.contains(&format!("And the answer: {expected}")));
    assert_eq!(orchestrator.total_tokens().await, 20);
    assert_eq!(orchestrator.history().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_shards_are_named_in_no_context_answer() -> Result<()> {
    let dir = tempdir()?;
    build_guideline_shard(dir.path())?;

    // a 2-dimensional query cannot search the 3-dimensional shard
    let generator = ScriptedGenerator::new(Vec::new());
    let orchestrator = orchestrator_with_query(dir.path(), generator.clone(), vec![1.0, 0.0]);

    let turn = orchestrator
        .query("First-line therapy?", QueryOptions::default())
        .await;

    assert_eq!(
        turn.answer,
        format!("{NO_CONTEXT_ANSWER} (1 of 1 shards could not be searched)")
    );
    assert!(turn.citations.is_empty());
    assert_eq!(turn.num_contexts, 0);
    assert!(generator.requests().is_empty());
    assert_eq!(orchestrator.history().await, vec![turn]);
    Ok(())
}

#[tokio::test]
async fn test_answer_with_followups_and_costs() -> Result<()> {
    let dir = tempdir()?;
    build_guideline_shard(dir.path())?;

    let generator = ScriptedGenerator::new(vec![
        generation("Start an ACE inhibitor.", 0.01, 100),
        generation("1. Which dose?\n\n2. When to add a diuretic?\n3. Monitoring?\n4. Extra", 0.002, 20),
    ]);
    let orchestrator = orchestrator(dir.path(), generator.clone());

    let turn = orchestrator
        .query("First-line therapy?", QueryOptions::default())
        .await;

    assert_eq!(turn.answer, "Start an ACE inhibitor.");
    assert_eq!(turn.cost, 0.01);
    assert_eq!(turn.tokens, 100);
    assert_eq!(
        turn.followup_questions,
        vec!["1. Which dose?", "2. When to add a diuretic?", "3. Monitoring?"]
    );
    assert_eq!(turn.citations[0].filename, "htn-2024.pdf");
    assert_eq!(turn.citations[0].shard_id, "cardiology");

    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0][0].content,
        format!("Answer from the guidelines.\n\nContext:\n[Source: htn-2024.pdf, Chunk 0]\n{PASSAGE}")
    );
    assert_eq!(requests[0][1], ChatMessage::user("First-line therapy?"));
    assert!(requests[1][0].content.contains("And the answer: Start an ACE inhibitor."));

    // follow-up usage counts toward the session only
    assert!((orchestrator.total_cost().await - 0.012).abs() < 1e-12);
    assert_eq!(orchestrator.total_tokens().await, 120);
    Ok(())
}

#[tokio::test]
async fn test_history_prefix_reset_and_export() -> Result<()> {
    let dir = tempdir()?;
    build_guideline_shard(dir.path())?;

    let generator = ScriptedGenerator::new(vec![
        generation("Start an ACE inhibitor.", 0.01, 100),
        generation("1. Which dose?", 0.001, 10),
        generation("Lisinopril 10 mg daily.", 0.02, 200),
        generation("1. Titration?", 0.001, 10),
    ]);
    let orchestrator = orchestrator(dir.path(), generator.clone());

    orchestrator
        .query("First-line therapy?", QueryOptions::default())
        .await;
    orchestrator
        .query("Which dose?", QueryOptions::default().with_history(true))
        .await;

    let requests = generator.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[2][0].content.contains(
        "Context:\nPrevious Q1: First-line therapy?\nPrevious A1: Start an ACE inhibitor....\n\n---\n\n[Source: htn-2024.pdf"
    ));

    let export_path = dir.path().join("session.json");
    orchestrator.export_history(&export_path).await?;
    let exported: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&export_path)?)?;
    assert_eq!(exported["conversation_history"].as_array().map(Vec::len), Some(2));
    assert_eq!(exported["total_tokens"], 320);
    assert_eq!(exported["model"], "scripted");
    assert_eq!(
        exported["conversation_history"][1]["answer"],
        "Lisinopril 10 mg daily."
    );
    assert!(exported["stores_base"].is_string());

    orchestrator.clear_history().await;
    assert!(orchestrator.history().await.is_empty());
    assert_eq!(orchestrator.total_tokens().await, 320);

    orchestrator.reset().await;
    assert_eq!(orchestrator.total_cost().await, 0.0);
    assert_eq!(orchestrator.total_tokens().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_shared_orchestrator_serializes_history() -> Result<()> {
    let dir = tempdir()?;
    build_guideline_shard(dir.path())?;

    let responses = (0..8).map(|i| generation(&format!("answer {i}"), 0.001, 1)).collect();
    let orchestrator = Arc::new(orchestrator(dir.path(), ScriptedGenerator::new(responses)));

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .query(&format!("question {i}"), QueryOptions::default())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await?;
    }

    assert_eq!(orchestrator.history().await.len(), 4);
    assert_eq!(orchestrator.total_tokens().await, 8);
    Ok(())
}
