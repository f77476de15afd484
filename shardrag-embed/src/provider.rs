//! The embedding interface and the constructor-selected agent that implements it

use crate::config::{BackendPreference, EmbedConfig};
use crate::error::{EmbedError, Result};
use crate::neural::NeuralEncoder;
use crate::sparse::{FittedVocabulary, SparseEncoder};
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for encoders that turn text into unit-length vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts` in order, processing at most `batch_size` texts per backend
    /// call. The output has exactly one vector per input.
    async fn embed_texts(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let texts = vec![text.to_string()];
        self.embed_texts(&texts, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_config("No embedding generated for text"))
    }

    /// Dimension of produced vectors, if fixed ahead of time. A sparse encoder
    /// without a fitted vocabulary has no fixed dimension.
    fn dimension(&self) -> Option<usize>;

    /// Short identifier for logs
    fn name(&self) -> &str;
}

/// The closed set of encoders, chosen once at construction.
#[derive(Debug, Clone)]
pub enum EmbeddingAgent {
    Neural(NeuralEncoder),
    Sparse(SparseEncoder),
}

impl EmbeddingAgent {
    /// Builds the agent according to `config.backend`.
    ///
    /// With [`BackendPreference::Auto`] a neural initialization failure, including
    /// an unsupported model name, is logged and the sparse encoder is used instead.
    /// With [`BackendPreference::Neural`] an unsupported model name is
    /// [`EmbedError::InvalidConfig`] and any other failure is returned as
    /// [`EmbedError::BackendUnavailable`]. A zero batch size is always rejected.
    pub async fn initialize(config: &EmbedConfig) -> Result<Self> {
        config.validate()?;
        match config.backend {
            BackendPreference::Sparse => {
                tracing::info!("Using sparse term-frequency encoder");
                Ok(Self::Sparse(SparseEncoder::unfitted()))
            }
            BackendPreference::Neural => {
                let encoder = NeuralEncoder::create(config)
                    .await
                    .map_err(|e| match e {
                        EmbedError::BackendUnavailable { .. } => e,
                        other => EmbedError::backend_unavailable(other),
                    })?;
                Ok(Self::Neural(encoder))
            }
            BackendPreference::Auto => match NeuralEncoder::create(config).await {
                Ok(encoder) => Ok(Self::Neural(encoder)),
                Err(e) => {
                    tracing::warn!(
                        "Neural encoder unavailable, falling back to sparse encoder: {}",
                        e
                    );
                    Ok(Self::Sparse(SparseEncoder::unfitted()))
                }
            },
        }
    }

    /// A sparse agent bound to a previously fitted vocabulary.
    pub fn with_vocabulary(vocabulary: Arc<FittedVocabulary>) -> Self {
        Self::Sparse(SparseEncoder::fitted(vocabulary))
    }

    pub fn is_neural(&self) -> bool {
        matches!(self, Self::Neural(_))
    }
}

#[async_trait]
impl Embedder for EmbeddingAgent {
    async fn embed_texts(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::Neural(encoder) => encoder.embed_texts(texts, batch_size).await,
            Self::Sparse(encoder) => encoder.embed_texts(texts, batch_size).await,
        }
    }

    fn dimension(&self) -> Option<usize> {
        match self {
            Self::Neural(encoder) => encoder.dimension(),
            Self::Sparse(encoder) => encoder.dimension(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Neural(encoder) => encoder.name(),
            Self::Sparse(encoder) => encoder.name(),
        }
    }
}

/// Scales `vector` to unit L2 norm in place and returns the original norm.
/// A zero vector is left untouched.
pub fn l2_normalize(vector: &mut [f32]) -> f32 {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
    norm
}
