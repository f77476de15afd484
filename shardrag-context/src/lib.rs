pub mod document;
pub mod text;

// Re-export the chunker and reader for external use
pub use document::{DocumentReader, ENV_PDF_PASSWORD, FsDocumentReader};
pub use text::{DocumentChunker, TextChunk, chunk_hash, chunk_text};
