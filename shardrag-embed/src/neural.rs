//! Neural encoder backed by a local ONNX sentence-embedding model via FastEmbed.
//!
//! FastEmbed tokenizes each batch, runs the transformer, and mean-pools the
//! per-token hidden states weighted by the attention mask. The pooled vectors are
//! L2-normalized here before they leave the encoder, so callers never depend on
//! the backend's own normalization.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{Embedder, l2_normalize};
use async_trait::async_trait;
use fastembed::{InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};

/// FastEmbed-based encoder using a real ONNX model
#[derive(Clone)]
pub struct NeuralEncoder {
    model_name: String,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl std::fmt::Debug for NeuralEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeuralEncoder")
            .field("model_name", &self.model_name)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl NeuralEncoder {
    /// Loads the configured model, probes its dimension and validates it.
    ///
    /// Any failure is reported as [`EmbedError::BackendUnavailable`] so the agent
    /// can decide whether to fall back.
    pub async fn create(config: &EmbedConfig) -> Result<Self> {
        let model_kind = config.fastembed_model()?;
        let model_name = config.model_name.clone();
        tracing::info!("Initializing neural encoder for model: {}", model_name);

        let mut init_options =
            InitOptions::new(model_kind).with_show_download_progress(config.show_download_progress);
        if let Some(cache_dir) = &config.cache_dir {
            init_options = init_options.with_cache_dir(cache_dir.clone());
        }

        let name_for_task = model_name.clone();
        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                let mut model =
                    TextEmbedding::try_new(init_options).map_err(EmbedError::backend_unavailable)?;

                let probe = model
                    .embed(vec!["dimension probe"], None)
                    .map_err(EmbedError::backend_unavailable)?;
                let dimension = probe.first().map(Vec::len).unwrap_or(0);
                if dimension == 0 {
                    return Err(EmbedError::backend_unavailable(anyhow::anyhow!(
                        "model {name_for_task} produced an empty embedding"
                    )));
                }
                if probe.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(EmbedError::backend_unavailable(anyhow::anyhow!(
                        "model {name_for_task} produced non-finite values"
                    )));
                }

                tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                Ok((model, dimension))
            })
            .await??;

        Ok(Self {
            model_name,
            model: Arc::new(Mutex::new(model)),
            dimension,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[async_trait]
impl Embedder for NeuralEncoder {
    async fn embed_texts(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = batch_size.max(1);
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size) {
            let batch = batch.to_vec();
            let model = Arc::clone(&self.model);

            let embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                tracing::debug!("Processing batch of {} texts", batch.len());
                let len = batch.len();
                let mut guard = model
                    .lock()
                    .map_err(|_| EmbedError::invalid_config("embedding model lock poisoned"))?;
                guard
                    .embed(batch, Some(len))
                    .map_err(EmbedError::embedding_gen)
            })
            .await??;

            for mut embedding in embeddings {
                if embedding.len() != self.dimension {
                    return Err(EmbedError::embedding_gen(anyhow::anyhow!(
                        "expected dimension {}, got {}",
                        self.dimension,
                        embedding.len()
                    )));
                }
                l2_normalize(&mut embedding);
                all_embeddings.push(embedding);
            }
        }

        tracing::debug!("Generated {} embeddings", all_embeddings.len());
        Ok(all_embeddings)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    fn name(&self) -> &str {
        "fastembed"
    }
}
