//! A single shard: a flat inner-product vector index plus aligned metadata.
//!
//! ## On-disk layout
//!
//! ```text
//! <shard>/index.bin       "SRIX" | version u32 | dimension u32 | count u64 | count*dimension f32
//! <shard>/metadata.json   [ {source, chunk_index, ...}, ... ]   one record per vector
//! <shard>/vectorizer.json optional fitted sparse vocabulary
//! ```
//!
//! All integers and floats are little-endian. Record `i` of `metadata.json`
//! describes vector `i` of `index.bin`; loading refuses a pair whose counts differ.
//!
//! Vectors are expected to be unit length, so the inner product used for scoring
//! is the cosine similarity.

use crate::error::{Result, ShardError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(not(target_endian = "little"))]
compile_error!("shard index payloads are stored as little-endian f32");

/// File name of the vector index inside a shard directory.
pub const INDEX_FILE: &str = "index.bin";
/// File name of the metadata records inside a shard directory.
pub const METADATA_FILE: &str = "metadata.json";

const MAGIC: &[u8; 4] = b"SRIX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Metadata stored for one indexed chunk.
///
/// `source` and `chunk_index` locate the chunk in its document. `chunk_hash` and
/// `text` are optional; fields this crate does not know about are preserved in
/// `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub chunk_index: usize,
    /// blake3 hex digest of the chunk text at index time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MetadataRecord {
    pub fn new(source: impl Into<String>, chunk_index: usize) -> Self {
        Self {
            source: Some(source.into()),
            chunk_index,
            chunk_hash: None,
            text: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Records the chunk's content hash without storing the text.
    pub fn with_chunk_hash(mut self, chunk_text: &str) -> Self {
        self.chunk_hash = Some(shardrag_context::chunk_hash(chunk_text));
        self
    }

    /// Stores the chunk text (and its hash) so retrieval never re-chunks the source.
    pub fn with_text(self, chunk_text: impl Into<String>) -> Self {
        let chunk_text = chunk_text.into();
        let mut record = self.with_chunk_hash(&chunk_text);
        record.text = Some(chunk_text);
        record
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// One search result from a single shard.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub score: f32,
    pub ordinal: usize,
    pub metadata: MetadataRecord,
}

/// A flat vector index with positionally aligned metadata.
#[derive(Debug, Clone)]
pub struct ShardIndex {
    path: PathBuf,
    dimension: usize,
    /// Row-major, `len() * dimension` values
    vectors: Vec<f32>,
    metadata: Vec<MetadataRecord>,
}

impl ShardIndex {
    /// Loads the shard at `path` if both artifacts exist, otherwise starts an
    /// empty index of `dimension`.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Result<Self> {
        let path = path.into();
        if Self::has_artifacts(&path) {
            let index = Self::load(&path)?;
            if index.dimension != dimension {
                tracing::warn!(
                    "Shard {} was built with dimension {}, not {}; keeping the stored dimension",
                    path.display(),
                    index.dimension,
                    dimension
                );
            }
            return Ok(index);
        }

        tracing::debug!("Creating empty shard index at {}", path.display());
        Ok(Self {
            path,
            dimension,
            vectors: Vec::new(),
            metadata: Vec::new(),
        })
    }

    /// Loads an existing shard. Both artifacts must be present and consistent.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let index_path = path.join(INDEX_FILE);
        let metadata_path = path.join(METADATA_FILE);

        for artifact in [&index_path, &metadata_path] {
            if !artifact.is_file() {
                return Err(ShardError::MissingArtifact {
                    path: artifact.clone(),
                });
            }
        }

        let (dimension, vectors) = decode_index(&index_path, &std::fs::read(&index_path)?)?;
        let metadata: Vec<MetadataRecord> =
            serde_json::from_slice(&std::fs::read(&metadata_path)?).map_err(|source| {
                ShardError::MetadataParse {
                    path: metadata_path.clone(),
                    source,
                }
            })?;

        let count = vectors.len() / dimension.max(1);
        if count != metadata.len() {
            return Err(ShardError::AlignmentMismatch {
                vectors: count,
                records: metadata.len(),
            });
        }

        tracing::debug!(
            "Loaded shard {} with {} vectors of dimension {}",
            path.display(),
            count,
            dimension
        );
        Ok(Self {
            path,
            dimension,
            vectors,
            metadata,
        })
    }

    /// True when `path` holds both the index and the metadata artifact.
    pub fn has_artifacts(path: &Path) -> bool {
        path.join(INDEX_FILE).is_file() && path.join(METADATA_FILE).is_file()
    }

    /// Appends vectors and their records in lockstep.
    pub fn add(&mut self, vectors: &[Vec<f32>], records: Vec<MetadataRecord>) -> Result<()> {
        if vectors.len() != records.len() {
            return Err(ShardError::LengthMismatch {
                vectors: vectors.len(),
                records: records.len(),
            });
        }
        if vectors.is_empty() {
            return Ok(());
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension) {
            return Err(ShardError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        self.vectors.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.vectors.extend_from_slice(vector);
        }
        self.metadata.extend(records);
        Ok(())
    }

    /// Persists both artifacts. Each is written to a temporary file in the shard
    /// directory and renamed into place.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        write_atomically(&self.path.join(INDEX_FILE), &self.encode_index())?;

        let metadata = serde_json::to_vec_pretty(&self.metadata).map_err(|source| {
            ShardError::MetadataParse {
                path: self.path.join(METADATA_FILE),
                source,
            }
        })?;
        write_atomically(&self.path.join(METADATA_FILE), &metadata)?;

        tracing::info!(
            "Saved shard {} ({} vectors)",
            self.path.display(),
            self.len()
        );
        Ok(())
    }

    /// The `top_k` records most similar to `query`, best first.
    ///
    /// Equal scores keep ordinal order.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(ShardError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if top_k == 0 || self.dimension == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(self.dimension)
            .map(|row| row.iter().zip(query).map(|(a, b)| a * b).sum::<f32>())
            .enumerate()
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .filter_map(|(ordinal, score)| {
                // Unreachable for a loaded index, which is checked for alignment.
                let metadata = self.metadata.get(ordinal)?;
                Some(SearchHit {
                    score,
                    ordinal,
                    metadata: metadata.clone(),
                })
            })
            .take(top_k)
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn records(&self) -> &[MetadataRecord] {
        &self.metadata
    }

    fn encode_index(&self) -> Vec<u8> {
        let payload: &[u8] = bytemuck::cast_slice(&self.vectors);
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }
}

fn decode_index(path: &Path, bytes: &[u8]) -> Result<(usize, Vec<f32>)> {
    if bytes.len() < HEADER_LEN {
        return Err(ShardError::corrupt(path, "file is shorter than the header"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(ShardError::corrupt(path, "bad magic bytes"));
    }

    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(ShardError::corrupt(
            path,
            format!("unsupported format version {version}"),
        ));
    }

    let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut count = [0u8; 8];
    count.copy_from_slice(&bytes[12..HEADER_LEN]);
    let count = u64::from_le_bytes(count) as usize;

    let expected = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| ShardError::corrupt(path, "vector count overflows"))?;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != expected {
        return Err(ShardError::corrupt(
            path,
            format!(
                "expected {expected} payload bytes for {count} vectors of dimension {dimension}, found {}",
                payload.len()
            ),
        ));
    }
    if count > 0 && dimension == 0 {
        return Err(ShardError::corrupt(path, "non-empty index with dimension 0"));
    }

    Ok((dimension, bytemuck::allocation::pod_collect_to_vec(payload)))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ShardError::Io { source: e.error })?;
    Ok(())
}
