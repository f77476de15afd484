//! Fan-out search across shards and the global top-k merge.
//!
//! Every shard is searched concurrently with its own embedder. Shards that fail
//! to load, reject the query vector, or miss the query deadline are reported in
//! [`Retrieval::reports`] and contribute nothing; the rest are merged.
//!
//! ## Merge order
//!
//! Candidates enter a max-heap keyed by `(score, insertion counter)`. Counters are
//! assigned in shard-discovery order and then by rank within each shard, so two
//! candidates with equal scores always come out in first-seen order regardless
//! of which shard finished searching first.

use crate::error::{Result, ShardError};
use crate::shard::{MetadataRecord, SearchHit, ShardHandle, ShardIndex};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use shardrag_embed::{EmbedError, Embedder, EmbeddingAgent, FittedVocabulary, VOCABULARY_FILE};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default bound on one query's shard fan-out.
pub const DEFAULT_QUERY_DEADLINE: Duration = Duration::from_secs(60);

/// Supplies the embedder used to encode queries for a given shard.
#[async_trait]
pub trait EmbedderFactory: Send + Sync {
    async fn for_shard(&self, shard: &ShardHandle) -> shardrag_embed::Result<Arc<dyn Embedder>>;
}

/// Uses the configured agent for every shard, except that a shard carrying a
/// fitted vocabulary gets a sparse agent bound to that vocabulary.
#[derive(Debug, Clone)]
pub struct AgentEmbedderFactory {
    agent: EmbeddingAgent,
}

impl AgentEmbedderFactory {
    pub fn new(agent: EmbeddingAgent) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl EmbedderFactory for AgentEmbedderFactory {
    async fn for_shard(&self, shard: &ShardHandle) -> shardrag_embed::Result<Arc<dyn Embedder>> {
        let vocabulary_path = shard.path.join(VOCABULARY_FILE);
        if !vocabulary_path.is_file() {
            return Ok(Arc::new(self.agent.clone()));
        }

        let path = vocabulary_path.clone();
        match tokio::task::spawn_blocking(move || FittedVocabulary::load(&path)).await? {
            Ok(vocabulary) => {
                tracing::debug!(
                    "Shard {} uses its fitted vocabulary ({} terms)",
                    shard.id,
                    vocabulary.len()
                );
                Ok(Arc::new(EmbeddingAgent::with_vocabulary(Arc::new(
                    vocabulary,
                ))))
            }
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable vocabulary {}: {}",
                    vocabulary_path.display(),
                    e
                );
                Ok(Arc::new(self.agent.clone()))
            }
        }
    }
}

/// Uses one embedder for every shard.
#[derive(Clone)]
pub struct SharedEmbedder(pub Arc<dyn Embedder>);

#[async_trait]
impl EmbedderFactory for SharedEmbedder {
    async fn for_shard(&self, _shard: &ShardHandle) -> shardrag_embed::Result<Arc<dyn Embedder>> {
        Ok(Arc::clone(&self.0))
    }
}

/// One merged search result, tagged with the shard it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalCandidate {
    pub score: f32,
    pub metadata: MetadataRecord,
    pub shard_id: String,
    pub shard_path: PathBuf,
}

/// What happened to one shard during a query.
#[derive(Debug)]
pub enum ShardOutcome {
    Searched { hits: usize },
    Failed { error: ShardError },
}

impl ShardOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug)]
pub struct ShardReport {
    pub shard: ShardHandle,
    pub outcome: ShardOutcome,
}

/// The result of one fan-out: merged candidates plus a report per shard.
#[derive(Debug, Default)]
pub struct Retrieval {
    pub candidates: Vec<RetrievalCandidate>,
    pub reports: Vec<ShardReport>,
}

impl Retrieval {
    pub fn failed_shards(&self) -> impl Iterator<Item = &ShardReport> {
        self.reports.iter().filter(|r| r.outcome.is_failed())
    }
}

struct Ranked {
    score: f32,
    sequence: u64,
    candidate: RetrievalCandidate,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    // Higher score first; on equal scores the lower sequence number wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Max-heap of candidates with first-seen tie-breaking.
#[derive(Default)]
pub struct MergeHeap {
    heap: BinaryHeap<Ranked>,
    next_sequence: u64,
}

impl MergeHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: RetrievalCandidate) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Ranked {
            score: candidate.score,
            sequence,
            candidate,
        });
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pops at most `top_k` candidates, best first.
    pub fn into_top(mut self, top_k: usize) -> Vec<RetrievalCandidate> {
        let mut out = Vec::with_capacity(top_k.min(self.heap.len()));
        while out.len() < top_k {
            match self.heap.pop() {
                Some(ranked) => out.push(ranked.candidate),
                None => break,
            }
        }
        out
    }
}

struct LoadedShard {
    index: ShardIndex,
    embedder: Arc<dyn Embedder>,
}

/// Searches a fixed set of shards and merges their results.
///
/// Loaded indexes and their embedders are cached after the first successful
/// load. Failed loads are not cached and are retried on the next query.
pub struct RetrievalMerger {
    shards: Vec<ShardHandle>,
    embedders: Arc<dyn EmbedderFactory>,
    deadline: Duration,
    cache: RwLock<HashMap<PathBuf, Arc<LoadedShard>>>,
}

impl RetrievalMerger {
    pub fn new(shards: Vec<ShardHandle>, embedders: Arc<dyn EmbedderFactory>) -> Self {
        Self {
            shards,
            embedders,
            deadline: DEFAULT_QUERY_DEADLINE,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Set the deadline for one query's fan-out (builder style)
    pub fn with_deadline(self, deadline: Duration) -> Self {
        Self { deadline, ..self }
    }

    pub fn shards(&self) -> &[ShardHandle] {
        &self.shards
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Number of shards currently held in the cache.
    pub async fn cached_shards(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Searches every shard for `query` and returns the global `top_k`.
    ///
    /// Each shard contributes at most `per_shard_k` candidates. Fewer than
    /// `top_k` candidates overall is not an error; all of them are returned.
    pub async fn retrieve(&self, query: &str, top_k: usize, per_shard_k: usize) -> Retrieval {
        let deadline = tokio::time::Instant::now() + self.deadline;
        let searches = self.shards.iter().map(|shard| async move {
            match tokio::time::timeout_at(deadline, self.search_shard(shard, query, per_shard_k))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ShardError::DeadlineExceeded {
                    deadline: self.deadline,
                }),
            }
        });
        let results = join_all(searches).await;

        let mut heap = MergeHeap::new();
        let mut reports = Vec::with_capacity(self.shards.len());
        for (shard, result) in self.shards.iter().zip(results) {
            let outcome = match result {
                Ok(hits) => {
                    let count = hits.len();
                    for hit in hits {
                        heap.push(RetrievalCandidate {
                            score: hit.score,
                            metadata: hit.metadata,
                            shard_id: shard.id.clone(),
                            shard_path: shard.path.clone(),
                        });
                    }
                    ShardOutcome::Searched { hits: count }
                }
                Err(error) => {
                    match &error {
                        ShardError::DimensionMismatch { .. }
                        | ShardError::UnfittedEmbedder { .. } => {
                            tracing::error!("Shard {} rejected the query: {}", shard.id, error)
                        }
                        _ => tracing::warn!("Skipping shard {}: {}", shard.id, error),
                    }
                    ShardOutcome::Failed { error }
                }
            };
            reports.push(ShardReport {
                shard: shard.clone(),
                outcome,
            });
        }

        let total = heap.len();
        let candidates = heap.into_top(top_k);
        tracing::info!(
            "Retrieved {} of {} candidates from {} shard(s)",
            candidates.len(),
            total,
            self.shards.len()
        );
        Retrieval {
            candidates,
            reports,
        }
    }

    async fn search_shard(
        &self,
        shard: &ShardHandle,
        query: &str,
        per_shard_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let loaded = self.load_shard(shard).await?;
        let vector = match loaded.embedder.embed_text(query).await {
            Ok(vector) => vector,
            // A sparse vocabulary that shares no terms with the query cannot match anything.
            Err(EmbedError::NoKnownTerms { .. }) => {
                tracing::debug!("Query shares no terms with shard {}", shard.id);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let hits =
            tokio::task::spawn_blocking(move || loaded.index.search(&vector, per_shard_k)).await??;
        tracing::debug!("Shard {} returned {} hits", shard.id, hits.len());
        Ok(hits)
    }

    async fn load_shard(&self, shard: &ShardHandle) -> Result<Arc<LoadedShard>> {
        if let Some(loaded) = self.cache.read().await.get(&shard.path) {
            return Ok(Arc::clone(loaded));
        }

        let path = shard.path.clone();
        let index = tokio::task::spawn_blocking(move || ShardIndex::load(path)).await??;
        let embedder = self.embedders.for_shard(shard).await?;
        match embedder.dimension() {
            Some(dimension) => check_dimension(index.dimension(), dimension)?,
            None if !index.is_empty() => {
                return Err(ShardError::UnfittedEmbedder {
                    expected: index.dimension(),
                });
            }
            None => {}
        }

        let loaded = Arc::new(LoadedShard { index, embedder });
        self.cache
            .write()
            .await
            .insert(shard.path.clone(), Arc::clone(&loaded));
        Ok(loaded)
    }
}

fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ShardError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::ShardDiscovery;
    use std::path::Path;
    use tempfile::tempdir;
    use tracing_test::traced_test;

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

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed_texts(
            &self,
            texts: &[String],
            _batch_size: usize,
        ) -> shardrag_embed::Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }

        fn dimension(&self) -> Option<usize> {
            Some(3)
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn candidate(score: f32, source: &str) -> RetrievalCandidate {
        RetrievalCandidate {
            score,
            metadata: MetadataRecord::new(source, 0),
            shard_id: "s".to_string(),
            shard_path: PathBuf::from("s"),
        }
    }

    fn write_shard(dir: &Path, rows: &[([f32; 3], &str)]) {
        let mut index = ShardIndex::open(dir, 3).unwrap();
        let vectors: Vec<Vec<f32>> = rows.iter().map(|(v, _)| v.to_vec()).collect();
        let records = rows
            .iter()
            .enumerate()
            .map(|(i, (_, source))| MetadataRecord::new(*source, i))
            .collect();
        index.add(&vectors, records).unwrap();
        index.save().unwrap();
    }

    fn fixed(query: [f32; 3]) -> Arc<dyn EmbedderFactory> {
        Arc::new(SharedEmbedder(Arc::new(FixedEmbedder(query.to_vec()))))
    }

    #[test]
    fn test_heap_orders_by_score_then_insertion() {
        let mut heap = MergeHeap::new();
        heap.push(candidate(0.5, "first-half"));
        heap.push(candidate(0.9, "best"));
        heap.push(candidate(0.5, "second-half"));
        heap.push(candidate(0.1, "worst"));

        let sources: Vec<String> = heap
            .into_top(10)
            .into_iter()
            .filter_map(|c| c.metadata.source)
            .collect();
        assert_eq!(sources, vec!["best", "first-half", "second-half", "worst"]);
    }

    #[test]
    fn test_heap_never_pads() {
        let mut heap = MergeHeap::new();
        heap.push(candidate(0.3, "only"));
        assert_eq!(heap.into_top(5).len(), 1);
        assert!(MergeHeap::new().into_top(3).is_empty());
    }

    #[tokio::test]
    async fn test_merges_across_shards() {
        let dir = tempdir().unwrap();
        write_shard(
            &dir.path().join("a"),
            &[([1.0, 0.0, 0.0], "a0.txt"), ([0.0, 1.0, 0.0], "a1.txt")],
        );
        write_shard(&dir.path().join("b"), &[([0.8, 0.6, 0.0], "b0.txt")]);

        let shards = ShardDiscovery::new(dir.path()).discover();
        let merger = RetrievalMerger::new(shards, fixed([1.0, 0.0, 0.0]));
        let retrieval = merger.retrieve("anything", 2, 10).await;

        let sources: Vec<&str> = retrieval
            .candidates
            .iter()
            .filter_map(|c| c.metadata.source.as_deref())
            .collect();
        assert_eq!(sources, vec!["a0.txt", "b0.txt"]);
        assert_eq!(retrieval.candidates[1].shard_id, "b");
        assert_eq!(retrieval.failed_shards().count(), 0);
        assert_eq!(merger.cached_shards().await, 2);
    }

    #[tokio::test]
    async fn test_equal_scores_follow_discovery_order() {
        let dir = tempdir().unwrap();
        write_shard(&dir.path().join("a"), &[([0.0, 0.0, 1.0], "from-a.txt")]);
        write_shard(&dir.path().join("b"), &[([0.0, 0.0, 1.0], "from-b.txt")]);

        let shards = ShardDiscovery::new(dir.path()).discover();
        let merger = RetrievalMerger::new(shards, fixed([0.0, 0.0, 1.0]));
        let retrieval = merger.retrieve("q", 2, 1).await;

        assert_eq!(retrieval.candidates[0].shard_id, "a");
        assert_eq!(retrieval.candidates[1].shard_id, "b");
    }

    #[traced_test]
    #[tokio::test]
    async fn test_broken_shard_is_skipped_and_retried() {
        let dir = tempdir().unwrap();
        write_shard(&dir.path().join("good"), &[([1.0, 0.0, 0.0], "good.txt")]);
        write_shard(&dir.path().join("bad"), &[([1.0, 0.0, 0.0], "bad.txt")]);
        let bad_index = dir.path().join("bad").join(crate::shard::INDEX_FILE);
        std::fs::write(&bad_index, b"garbage").unwrap();

        let shards = ShardDiscovery::new(dir.path()).discover();
        let merger = RetrievalMerger::new(shards, fixed([1.0, 0.0, 0.0]));
        let retrieval = merger.retrieve("q", 10, 10).await;

        assert_eq!(retrieval.candidates.len(), 1);
        assert_eq!(retrieval.candidates[0].shard_id, "good");
        let failed: Vec<&str> = retrieval
            .failed_shards()
            .map(|r| r.shard.id.as_str())
            .collect();
        assert_eq!(failed, vec!["bad"]);
        assert!(logs_contain("Skipping shard bad"));
        assert_eq!(merger.cached_shards().await, 1);

        // repaired between queries
        std::fs::remove_file(&bad_index).unwrap();
        write_shard(&dir.path().join("bad"), &[([1.0, 0.0, 0.0], "bad.txt")]);
        let retrieval = merger.retrieve("q", 10, 10).await;
        assert_eq!(retrieval.candidates.len(), 2);
        assert_eq!(merger.cached_shards().await, 2);
    }

    #[traced_test]
    #[tokio::test]
    async fn test_dimension_mismatch_fails_shard() {
        let dir = tempdir().unwrap();
        write_shard(dir.path(), &[([1.0, 0.0, 0.0], "a.txt")]);

        let shards = ShardDiscovery::new(dir.path()).discover();
        let factory: Arc<dyn EmbedderFactory> =
            Arc::new(SharedEmbedder(Arc::new(FixedEmbedder(vec![1.0, 0.0]))));
        let merger = RetrievalMerger::new(shards, factory);
        let retrieval = merger.retrieve("q", 10, 10).await;

        assert!(retrieval.candidates.is_empty());
        assert!(matches!(
            retrieval.reports[0].outcome,
            ShardOutcome::Failed {
                error: ShardError::DimensionMismatch { expected: 3, actual: 2 }
            }
        ));
        assert!(logs_contain("rejected the query"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_unfitted_sparse_agent_fails_shard_without_vocabulary() {
        let dir = tempdir().unwrap();
        write_shard(dir.path(), &[([1.0, 0.0, 0.0], "a.txt")]);

        let agent = EmbeddingAgent::initialize(&shardrag_embed::EmbedConfig::sparse())
            .await
            .unwrap();
        let shards = ShardDiscovery::new(dir.path()).discover();
        let merger = RetrievalMerger::new(shards, Arc::new(AgentEmbedderFactory::new(agent)));
        // three distinct terms would otherwise line up with the index columns
        let retrieval = merger.retrieve("aspirin statin warfarin", 10, 10).await;

        assert!(retrieval.candidates.is_empty());
        assert!(matches!(
            retrieval.reports[0].outcome,
            ShardOutcome::Failed {
                error: ShardError::UnfittedEmbedder { expected: 3 }
            }
        ));
        assert!(logs_contain("rejected the query"));
        assert_eq!(merger.cached_shards().await, 0);
    }

    #[tokio::test]
    async fn test_deadline_cancels_slow_shards() {
        let dir = tempdir().unwrap();
        write_shard(dir.path(), &[([1.0, 0.0, 0.0], "a.txt")]);

        let shards = ShardDiscovery::new(dir.path()).discover();
        let factory: Arc<dyn EmbedderFactory> = Arc::new(SharedEmbedder(Arc::new(SlowEmbedder)));
        let merger =
            RetrievalMerger::new(shards, factory).with_deadline(Duration::from_millis(50));
        let retrieval = merger.retrieve("q", 10, 10).await;

        assert!(retrieval.candidates.is_empty());
        assert!(matches!(
            retrieval.reports[0].outcome,
            ShardOutcome::Failed {
                error: ShardError::DeadlineExceeded { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_agent_factory_prefers_shard_vocabulary() {
        let dir = tempdir().unwrap();
        let corpus = vec![
            "asthma inhaler dosing".to_string(),
            "heart failure diuretics".to_string(),
        ];
        let vocabulary = FittedVocabulary::fit(&corpus);
        vocabulary.save(&dir.path().join(VOCABULARY_FILE)).unwrap();

        let agent = EmbeddingAgent::initialize(&shardrag_embed::EmbedConfig::sparse())
            .await
            .unwrap();
        let factory = AgentEmbedderFactory::new(agent);
        let embedder = factory.for_shard(&ShardHandle::new(dir.path())).await.unwrap();
        assert_eq!(embedder.dimension(), Some(vocabulary.dimension()));

        let other = tempdir().unwrap();
        let embedder = factory.for_shard(&ShardHandle::new(other.path())).await.unwrap();
        assert_eq!(embedder.dimension(), None);
    }
}
