//! Error types for the embedding system

use std::path::PathBuf;

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// `BackendUnavailable` is the only variant that is fatal at startup: it is
/// returned when the neural backend was explicitly requested and could not be
/// initialized, leaving no encoder to fall back to.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when the embedding configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Error when the neural backend cannot be initialized
    #[error("Embedding backend unavailable: {source}")]
    BackendUnavailable {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error during embedding generation
    #[error("Embedding generation failed: {source}")]
    EmbeddingGeneration {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A text produced an all-zero vector that cannot be normalized
    #[error("Text has no terms known to the vocabulary: {text:?}")]
    NoKnownTerms { text: String },

    /// Error loading or saving a fitted vocabulary artifact
    #[error("Vocabulary artifact {path} is invalid: {message}")]
    VocabularyLoad { path: PathBuf, message: String },

    /// IO errors when reading model or vocabulary files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Wraps a backend initialization failure.
    pub fn backend_unavailable<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::BackendUnavailable {
            source: source.into(),
        }
    }

    /// Wraps a failure that happened while generating embeddings.
    pub fn embedding_gen<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::EmbeddingGeneration {
            source: source.into(),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
