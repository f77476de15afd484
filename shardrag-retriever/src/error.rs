//! Error types for shard loading and retrieval

use shardrag_embed::EmbedError;
use std::path::PathBuf;
use std::time::Duration;

/// Result type for shard operations.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Everything that can go wrong while loading or searching one shard.
///
/// None of these abort a query: the merger records them per shard as
/// [`ShardOutcome::Failed`](crate::merge::ShardOutcome::Failed) and carries on
/// with the remaining shards.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// One of the two required artifacts is missing from the shard directory
    #[error("Shard artifact missing: {path}")]
    MissingArtifact { path: PathBuf },

    /// The vector index file is truncated or not an index at all
    #[error("Corrupt index file {path}: {message}")]
    CorruptIndex { path: PathBuf, message: String },

    /// The metadata file is not a JSON array of records
    #[error("Failed to parse metadata {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The persisted vector count and metadata count disagree
    #[error("Index holds {vectors} vectors but metadata holds {records} records")]
    AlignmentMismatch { vectors: usize, records: usize },

    /// A vector does not have the index's dimension
    #[error("Dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The query encoder has no fixed dimension (a sparse encoder without a
    /// fitted vocabulary), so its vectors cannot be compared with this index
    #[error("Index expects dimension {expected} but the query encoder has no fitted vocabulary")]
    UnfittedEmbedder { expected: usize },

    /// `add` was called with different numbers of vectors and records
    #[error("Cannot add {vectors} vectors with {records} metadata records")]
    LengthMismatch { vectors: usize, records: usize },

    /// The query deadline expired before this shard answered
    #[error("Shard search did not finish within {deadline:?}")]
    DeadlineExceeded { deadline: Duration },

    /// The shard's embedder could not be built or failed to embed the query
    #[error("Embedding failed: {source}")]
    Embed {
        #[from]
        source: EmbedError,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },
}

impl ShardError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CorruptIndex {
            path: path.into(),
            message: message.into(),
        }
    }
}
