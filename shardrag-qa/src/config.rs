//! Configuration for the question-answering pipeline.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables (a `.env` file is honoured by the binary), then
//! command-line flags applied by the caller.
//!
//! ```toml
//! stores_base = "vector_stores"
//!
//! [chunking]
//! chunk_chars = 1500
//! overlap_chars = 200
//!
//! [embedding]
//! backend = "auto"
//! model = "all-MiniLM-L6-v2"
//!
//! [retrieval]
//! top_k = 10
//! per_shard_k = 10
//!
//! [generation]
//! model = "gpt-4o"
//! temperature = 0.0
//!
//! [generation.pricing.gpt-4o]
//! prompt_per_1k = 0.0025
//! completion_per_1k = 0.01
//! ```

use crate::error::{QaError, Result};
use serde::{Deserialize, Serialize};
use shardrag_context::DocumentChunker;
use shardrag_embed::{BackendPreference, EmbedConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_STORES_BASE: &str = "SHARDRAG_STORES_BASE";
pub const ENV_MODEL: &str = "SHARDRAG_MODEL";

/// Placeholder in the system prompt that receives the assembled context.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert assistant helping a physician give \
guideline-based recommendations for patient care. Treat the most recent guideline in the context \
as the primary source and compare it with guidelines published within two years of it. If no \
recent guideline covers the question, use older material and say explicitly that recent guidance \
is missing.\n\n\
Answer with these sections:\n\
(Recommendation:) a clear, concise recommendation and the guideline it comes from.\n\
(Rationale and Supportive Arguments:) the reasoning, pathophysiology and data behind it, and the \
risk of not following it.\n\
(Important Considerations:) patient factors, risks, complications and alternative strategies.\n\
(Relevant guidelines:) the guidelines used, with title and year, and where they disagree.\n\
(Areas of uncertainty and Controversies in management:) opposing views and open questions.\n\
(Primary source of data:) titles, societies and years of the guidelines used.\n\n\
If the context does not support a recommendation, say so. If you don't know the answer, say that \
you don't know.\n\nContext:\n{context}";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Directory holding the shard directories
    pub stores_base: PathBuf,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    /// Read from the environment only, never from the TOML file
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// Chunking parameters. They must match the ones used to build the shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_chars: usize,
    pub overlap_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: BackendPreference,
    pub model: String,
    pub cache_dir: Option<PathBuf>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub per_shard_k: usize,
    pub query_deadline_secs: u64,
}

/// USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub api_base: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub system_prompt: String,
    pub pricing: BTreeMap<String, ModelPricing>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            stores_base: PathBuf::from("vector_stores"),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            generation: GenerationConfig::default(),
            api_key: None,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: shardrag_context::text::DEFAULT_CHUNK_CHARS,
            overlap_chars: shardrag_context::text::DEFAULT_OVERLAP_CHARS,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let embed = EmbedConfig::default();
        Self {
            backend: embed.backend,
            model: embed.model_name,
            cache_dir: embed.cache_dir,
            batch_size: embed.batch_size,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            per_shard_k: 10,
            query_deadline_secs: 60,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            api_base: "https://api.openai.com/v1".to_string(),
            request_timeout_secs: 120,
            max_retries: 3,
            initial_backoff_ms: 500,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            pricing: default_pricing(),
        }
    }
}

fn default_pricing() -> BTreeMap<String, ModelPricing> {
    [
        ("gpt-4o", 0.0025, 0.01),
        ("gpt-4o-mini", 0.00015, 0.0006),
        ("gpt-4-turbo", 0.01, 0.03),
        ("gpt-4", 0.03, 0.06),
        ("gpt-3.5-turbo", 0.0005, 0.0015),
    ]
    .into_iter()
    .map(|(model, prompt_per_1k, completion_per_1k)| {
        (
            model.to_string(),
            ModelPricing {
                prompt_per_1k,
                completion_per_1k,
            },
        )
    })
    .collect()
}

impl GenerationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Pricing for `model`: an exact entry, else the longest entry that prefixes
    /// it (so dated snapshots like `gpt-4o-2024-08-06` price as `gpt-4o`).
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        if let Some(pricing) = self.pricing.get(model) {
            return Some(*pricing);
        }
        self.pricing
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, pricing)| *pricing)
    }
}

impl RagConfig {
    /// Defaults, overlaid with `path` if given, overlaid with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            QaError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
            .map_err(|e| QaError::configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| QaError::configuration(e.to_string()))
    }

    /// Applies environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(base) = non_empty(ENV_STORES_BASE) {
            self.stores_base = PathBuf::from(base);
        }
        if let Some(model) = non_empty(ENV_MODEL) {
            self.generation.model = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        DocumentChunker::checked(self.chunking.chunk_chars, self.chunking.overlap_chars)
            .map_err(|e| QaError::configuration(format!("chunking.{e}")))?;
        if self.embedding.batch_size == 0 {
            return Err(QaError::configuration("embedding.batch_size must be at least 1"));
        }
        if !self.generation.system_prompt.contains(CONTEXT_PLACEHOLDER) {
            tracing::warn!(
                "generation.system_prompt has no {} placeholder; context will be appended",
                CONTEXT_PLACEHOLDER
            );
        }
        Ok(())
    }

    /// The API key, or a configuration error if none was provided.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            QaError::configuration(format!(
                "{ENV_API_KEY} is not set. Set it in your environment or in a .env file."
            ))
        })
    }

    pub fn embed_config(&self) -> EmbedConfig {
        EmbedConfig {
            backend: self.embedding.backend,
            model_name: self.embedding.model.clone(),
            cache_dir: self.embedding.cache_dir.clone(),
            batch_size: self.embedding.batch_size,
            ..EmbedConfig::default()
        }
    }

    pub fn chunker(&self) -> DocumentChunker {
        DocumentChunker::new(self.chunking.chunk_chars, self.chunking.overlap_chars)
    }

    pub fn query_deadline(&self) -> Duration {
        Duration::from_secs(self.retrieval.query_deadline_secs)
    }
}
