//! shardrag-retriever: query-time retrieval over a directory of vector shards
//!
//! A shard is a directory holding a flat vector index (`index.bin`) and one
//! metadata record per vector (`metadata.json`). This crate finds the shards under
//! a base path, searches all of them for a query, merges the per-shard results
//! into one ranked list, and turns that list into quoted passages with citations.
//!
//! ## Key Modules
//!
//! - **[`shard`]**: the on-disk index format and shard discovery
//! - **[`merge`]**: concurrent fan-out and the global top-k merge
//! - **[`context`]**: passage reconstruction and citation building
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use shardrag_context::DocumentChunker;
//! use shardrag_embed::{EmbedConfig, EmbeddingAgent};
//! use shardrag_retriever::{
//!     AgentEmbedderFactory, ContextAssembler, RetrievalMerger, ShardDiscovery,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let shards = ShardDiscovery::new("vector_stores").discover();
//! let agent = EmbeddingAgent::initialize(&EmbedConfig::default()).await?;
//! let merger = RetrievalMerger::new(shards, Arc::new(AgentEmbedderFactory::new(agent)));
//!
//! let retrieval = merger.retrieve("first-line treatment for hypertension", 10, 10).await;
//! let context = ContextAssembler::from_fs(DocumentChunker::default())
//!     .assemble(&retrieval.candidates);
//! println!("{}", context.text);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ShardDiscovery → RetrievalMerger ─┬─ shard 1: embed query → ShardIndex::search ─┐
//!                                   ├─ shard 2: ...                               ├→ MergeHeap → top-k
//!                                   └─ shard n: ...                               ┘
//!                  top-k → ContextAssembler → context text + citations
//! ```

pub mod context;
pub mod error;
pub mod merge;
pub mod shard;

pub use context::{AssembledContext, Citation, ContextAssembler, PassageText};
pub use error::{Result, ShardError};
pub use merge::{
    AgentEmbedderFactory, EmbedderFactory, MergeHeap, Retrieval, RetrievalCandidate,
    RetrievalMerger, SharedEmbedder, ShardOutcome, ShardReport,
};
pub use shard::{MetadataRecord, SearchHit, ShardDiscovery, ShardHandle, ShardIndex};
