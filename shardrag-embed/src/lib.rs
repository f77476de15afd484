//! # shardrag-embed
//!
//! Turns text into unit-length vectors for the shard retriever.
//!
//! Two encoders are available behind the [`Embedder`] trait:
//!
//! - a **neural** encoder running a local ONNX sentence-embedding model via FastEmbed
//! - a **sparse** TF-IDF encoder that needs no model files
//!
//! [`EmbeddingAgent`] picks one at construction time according to
//! [`EmbedConfig::backend`]. With the default `auto` preference the neural encoder is
//! tried first and the sparse encoder is used if it cannot be loaded.
//!
//! ```no_run
//! use shardrag_embed::{EmbedConfig, Embedder, EmbeddingAgent};
//!
//! # async fn example() -> shardrag_embed::Result<()> {
//! let agent = EmbeddingAgent::initialize(&EmbedConfig::default()).await?;
//! let texts = vec!["First-line treatment for hypertension".to_string()];
//! let vectors = agent.embed_texts(&texts, 16).await?;
//! println!("{} produced {} vectors", agent.name(), vectors.len());
//! # Ok(())
//! # }
//! ```
//!
//! Shards built with the sparse encoder store their fitted vocabulary next to the
//! index (see [`sparse::VOCABULARY_FILE`]); load it with
//! [`FittedVocabulary::load`] and build a query agent with
//! [`EmbeddingAgent::with_vocabulary`] so query vectors share the shard's columns.

pub mod config;
pub mod error;
pub mod neural;
pub mod provider;
pub mod sparse;

pub use config::{BackendPreference, EmbedConfig};
pub use error::{EmbedError, Result};
pub use neural::NeuralEncoder;
pub use provider::{Embedder, EmbeddingAgent, l2_normalize};
pub use sparse::{FittedVocabulary, SparseEncoder, VOCABULARY_FILE};
