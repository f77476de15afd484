//! Error types for question answering

use std::time::Duration;

/// Result type for question-answering operations.
pub type Result<T> = std::result::Result<T, QaError>;

/// Errors raised by configuration loading and the generation client.
///
/// Only [`QaError::Configuration`] is meant to stop the program: it is returned
/// before any query is served. Generation errors are turned into degraded
/// answers by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    /// Missing credentials, invalid settings, or no usable embedding backend
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The model answered, but not with something usable
    #[error("Generation failed: {message}")]
    Generation { message: String },

    /// The generation endpoint returned a non-success status
    #[error("Generation endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Generation request timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("HTTP transport error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl QaError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn generation<S: Into<String>>(message: S) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed: transport failures, rate limiting,
    /// and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Http { source } => source.is_timeout() || source.is_connect() || source.is_request(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<shardrag_embed::EmbedError> for QaError {
    fn from(e: shardrag_embed::EmbedError) -> Self {
        Self::configuration(e.to_string())
    }
}
