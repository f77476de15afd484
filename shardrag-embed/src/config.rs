//! Configuration for the embedding agent

use crate::error::{EmbedError, Result};
use fastembed::EmbeddingModel;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which encoder the agent should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Neural encoder if it initializes, sparse encoder otherwise.
    #[default]
    Auto,
    /// Neural encoder only; failing to initialize it is fatal.
    Neural,
    /// Sparse term-frequency encoder only.
    Sparse,
}

impl std::str::FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "neural" => Ok(Self::Neural),
            "sparse" => Ok(Self::Sparse),
            _ => Err(format!("Invalid backend: {s} (expected auto, neural or sparse)")),
        }
    }
}

/// Configuration for the embedding agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Encoder selection policy
    pub backend: BackendPreference,
    /// Name of the neural embedding model
    pub model_name: String,
    /// Directory where the neural backend caches downloaded model files
    pub cache_dir: Option<PathBuf>,
    /// Maximum batch size for embedding generation
    pub batch_size: usize,
    /// Whether to show a progress bar while the model downloads
    pub show_download_progress: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            model_name: "all-MiniLM-L6-v2".to_string(),
            cache_dir: None,
            batch_size: 16,
            show_download_progress: false,
        }
    }
}

impl EmbedConfig {
    /// Create a configuration for the named neural model.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Configuration that never touches the neural backend.
    pub fn sparse() -> Self {
        Self {
            backend: BackendPreference::Sparse,
            ..Self::default()
        }
    }

    /// Set the backend preference (builder style)
    pub fn with_backend(self, backend: BackendPreference) -> Self {
        Self { backend, ..self }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set the model cache directory (builder style)
    pub fn with_cache_dir(self, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
            ..self
        }
    }

    /// Map the configured model name onto a fastembed model.
    pub fn fastembed_model(&self) -> Result<EmbeddingModel> {
        let model = match self.model_name.to_ascii_lowercase().as_str() {
            "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
                EmbeddingModel::AllMiniLML6V2
            }
            "all-minilm-l12-v2" | "sentence-transformers/all-minilm-l12-v2" => {
                EmbeddingModel::AllMiniLML12V2
            }
            "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            "snowflake-arctic-embed-xs" => EmbeddingModel::SnowflakeArcticEmbedXS,
            other => {
                return Err(EmbedError::invalid_config(format!(
                    "Unsupported embedding model: {other}"
                )));
            }
        };
        Ok(model)
    }

    /// Validate settings that would otherwise fail deep inside a call.
    ///
    /// The model name is only checked when the neural backend is mandatory.
    /// Under [`BackendPreference::Auto`] an unknown model is a neural
    /// initialization failure and falls back to the sparse encoder.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.backend == BackendPreference::Neural {
            self.fastembed_model()?;
        }
        Ok(())
    }
}
