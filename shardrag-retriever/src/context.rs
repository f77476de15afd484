//! Turning merged candidates into quoted passages and citations.
//!
//! A passage is taken from the record's stored `text` when present. Otherwise the
//! source document is read again, re-chunked with the chunker used at index time,
//! and the chunk at `chunk_index` is selected. If the record carries a
//! `chunk_hash`, the re-derived chunk must match it. Anything that prevents a
//! passage from being resolved yields a placeholder, never an error.

use crate::merge::RetrievalCandidate;
use serde::{Deserialize, Serialize};
use shardrag_context::{DocumentChunker, DocumentReader, FsDocumentReader, chunk_hash};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Separator placed between context blocks.
pub const BLOCK_SEPARATOR: &str = "\n\n---\n\n";

const UNKNOWN_SOURCE: &str = "Unknown";

/// A deduplicated reference to a source document backing an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub filename: String,
    pub shard_id: String,
    pub score: f32,
}

/// Text for one candidate, or why there is none.
#[derive(Debug, Clone, PartialEq)]
pub enum PassageText {
    Resolved(String),
    Unavailable { reason: String },
}

impl PassageText {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Resolved(text) => Some(text),
            Self::Unavailable { .. } => None,
        }
    }
}

/// The assembled context for a set of candidates.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    /// Tagged blocks joined by [`BLOCK_SEPARATOR`]
    pub text: String,
    pub passages: Vec<PassageText>,
    pub citations: Vec<Citation>,
}

/// Reconstructs passages and builds citations.
#[derive(Clone)]
pub struct ContextAssembler {
    chunker: DocumentChunker,
    reader: Arc<dyn DocumentReader>,
}

impl ContextAssembler {
    pub fn new(chunker: DocumentChunker, reader: Arc<dyn DocumentReader>) -> Self {
        Self { chunker, reader }
    }

    /// Assembler reading sources from the local filesystem.
    pub fn from_fs(chunker: DocumentChunker) -> Self {
        Self::new(chunker, Arc::new(FsDocumentReader::new()))
    }

    pub fn chunker(&self) -> &DocumentChunker {
        &self.chunker
    }

    /// Builds the context text and citation list for `candidates`, in order.
    ///
    /// Each source document is read and chunked at most once per call.
    pub fn assemble(&self, candidates: &[RetrievalCandidate]) -> AssembledContext {
        let mut documents: HashMap<String, Vec<String>> = HashMap::new();
        let mut blocks = Vec::with_capacity(candidates.len());
        let mut passages = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let passage = self.resolve(candidate, &mut documents);
            let record = &candidate.metadata;
            let filename = file_name(record.source.as_deref().unwrap_or(UNKNOWN_SOURCE));
            let block = match &passage {
                PassageText::Resolved(text) => {
                    format!("[Source: {filename}, Chunk {}]\n{text}", record.chunk_index)
                }
                PassageText::Unavailable { reason } => {
                    tracing::warn!(
                        "No text for {} chunk {} (shard {}): {}",
                        record.source.as_deref().unwrap_or(UNKNOWN_SOURCE),
                        record.chunk_index,
                        candidate.shard_id,
                        reason
                    );
                    format!(
                        "[Source: {filename}, Chunk {}] (text unavailable)",
                        record.chunk_index
                    )
                }
            };
            blocks.push(block);
            passages.push(passage);
        }

        AssembledContext {
            text: blocks.join(BLOCK_SEPARATOR),
            passages,
            citations: citations(candidates),
        }
    }

    /// Resolves the passage text for a single candidate.
    pub fn passage(&self, candidate: &RetrievalCandidate) -> PassageText {
        self.resolve(candidate, &mut HashMap::new())
    }

    fn resolve(
        &self,
        candidate: &RetrievalCandidate,
        documents: &mut HashMap<String, Vec<String>>,
    ) -> PassageText {
        let record = &candidate.metadata;
        if let Some(text) = &record.text {
            return PassageText::Resolved(text.clone());
        }

        let Some(source) = cited_source(candidate) else {
            return PassageText::unavailable("record has no source");
        };

        if !documents.contains_key(source) {
            let path = Path::new(source);
            if !path.exists() {
                return PassageText::unavailable(format!("{source} not found"));
            }
            let full_text = self.reader.read_text(path);
            documents.insert(source.to_string(), self.chunker.chunk(&full_text));
        }

        let chunks = documents.get(source).map(Vec::as_slice).unwrap_or_default();
        let Some(chunk) = chunks.get(record.chunk_index) else {
            return PassageText::unavailable(format!(
                "chunk {} out of range ({} chunks)",
                record.chunk_index,
                chunks.len()
            ));
        };

        if let Some(expected) = &record.chunk_hash {
            if *expected != chunk_hash(chunk) {
                return PassageText::unavailable(
                    "chunk hash mismatch; the source or the chunking parameters changed since indexing",
                );
            }
        }

        PassageText::Resolved(chunk.clone())
    }
}

/// Citations for `candidates`, one per distinct source, in rank order.
///
/// Records without a source are not cited.
pub fn citations(candidates: &[RetrievalCandidate]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter_map(|candidate| {
            let source = cited_source(candidate)?;
            if !seen.insert(source) {
                return None;
            }
            Some(Citation {
                source: source.to_string(),
                filename: file_name(source),
                shard_id: candidate.shard_id.clone(),
                score: candidate.score,
            })
        })
        .collect()
}

fn cited_source(candidate: &RetrievalCandidate) -> Option<&str> {
    candidate
        .metadata
        .source
        .as_deref()
        .filter(|source| !source.is_empty() && *source != UNKNOWN_SOURCE)
}

fn file_name(source: &str) -> String {
    Path::new(source)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}
