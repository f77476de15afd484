//! Deterministic text chunking shared by shard construction and query-time
//! passage reconstruction.
//!
//! Shards persist only `(source, chunk_index)` for each vector. When a hit is
//! turned back into quoted text, the source document is re-read and re-chunked
//! with this module, and the chunk at `chunk_index` is selected. That only works
//! if chunking is a pure function of `(text, chunk_chars, overlap_chars)`, so
//! nothing in here may depend on hashing order, locale, or global state.
//!
//! # Algorithm
//!
//! 1. Line endings are normalized (`\r\n` → `\n`), the text is trimmed and split
//!    on blank lines into paragraphs.
//! 2. A paragraph of at most `chunk_chars` characters is emitted as-is.
//! 3. A longer paragraph is split into sentence-like units after `.`, `?` or `!`
//!    followed by whitespace. Units are packed greedily into a buffer joined by a
//!    single space; the buffer is flushed when the next unit would overflow it.
//! 4. A unit that alone exceeds `chunk_chars` is cut into fixed windows that
//!    advance by `chunk_chars - overlap_chars` characters.
//! 5. A second pass re-applies the window split to anything still too long.
//! 6. Empty chunks are dropped.
//!
//! Lengths are counted in Unicode scalar values (`char`s), never bytes, so a
//! window never splits a code point.
//!
//! # Example
//!
//! ```
//! use shardrag_context::text::chunk_text;
//!
//! let chunks = chunk_text("Paragraph one.\n\nParagraph two.", 1000, 200);
//! assert_eq!(chunks, vec!["Paragraph one.", "Paragraph two."]);
//! ```
use regex::Regex;
use serde::Serialize;
use std::iter;
use std::sync::LazyLock;

/// Default maximum chunk length in characters.
pub const DEFAULT_CHUNK_CHARS: usize = 1500;

/// Default overlap between consecutive forced windows, in characters.
pub const DEFAULT_OVERLAP_CHARS: usize = 200;

/// Blank-line paragraph boundary (a newline, optional whitespace, a newline).
static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Sentence-ending punctuation followed by a whitespace run. The punctuation
/// stays with the preceding sentence; the whitespace is the separator.
static SENTENCE_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.?!]\s+").unwrap());

/// Chunking parameters. Two chunkers with equal parameters always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DocumentChunker {
    chunk_chars: usize,
    overlap_chars: usize,
}

/// A chunk with its ordinal position in the document's segmentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Position of this chunk in the segmentation (0-indexed).
    pub index: usize,
    /// The chunk text.
    pub text: String,
}

impl TextChunk {
    /// Blake3 content hash of the chunk text, hex encoded.
    pub fn hash(&self) -> String {
        chunk_hash(&self.text)
    }
}

impl Default for DocumentChunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_CHARS, DEFAULT_OVERLAP_CHARS)
    }
}

impl DocumentChunker {
    /// Creates a chunker.
    ///
    /// `chunk_chars` is clamped to at least 1. An `overlap_chars` that is not
    /// smaller than `chunk_chars` would stop windows from advancing, so windows
    /// then advance by a single character instead.
    pub fn new(chunk_chars: usize, overlap_chars: usize) -> Self {
        Self {
            chunk_chars: chunk_chars.max(1),
            overlap_chars,
        }
    }

    /// Creates a chunker, rejecting parameters that `new` would have to repair:
    /// a zero `chunk_chars`, or an overlap that is not smaller than it.
    pub fn checked(chunk_chars: usize, overlap_chars: usize) -> Result<Self, String> {
        if chunk_chars == 0 {
            return Err("chunk_chars must be at least 1".to_string());
        }
        if overlap_chars >= chunk_chars {
            return Err(format!(
                "overlap_chars ({overlap_chars}) must be smaller than chunk_chars ({chunk_chars})"
            ));
        }
        Ok(Self::new(chunk_chars, overlap_chars))
    }

    pub fn chunk_chars(&self) -> usize {
        self.chunk_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// How far a forced window advances.
    fn stride(&self) -> usize {
        self.chunk_chars.saturating_sub(self.overlap_chars).max(1)
    }

    /// Splits `text` into its ordered chunk sequence.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let normalized = text.replace("\r\n", "\n");
        let normalized = normalized.trim();

        let mut chunks: Vec<String> = Vec::new();
        for paragraph in PARAGRAPH_BREAK
            .split(normalized)
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            if char_len(paragraph) <= self.chunk_chars {
                chunks.push(paragraph.to_string());
                continue;
            }
            self.pack_sentences(paragraph, &mut chunks);
        }

        // Second pass: nothing longer than chunk_chars survives.
        let mut final_chunks = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if char_len(&chunk) <= self.chunk_chars {
                final_chunks.push(chunk);
            } else {
                final_chunks.extend(self.windows(&chunk).map(str::to_string));
            }
        }

        final_chunks.retain(|c| !c.is_empty());
        final_chunks
    }

    /// Chunks `text` and tags each chunk with its ordinal.
    pub fn chunks(&self, text: &str) -> Vec<TextChunk> {
        self.chunk(text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| TextChunk { index, text })
            .collect()
    }

    /// Returns the chunk at `index`, or `None` when the document has fewer chunks.
    pub fn chunk_at(&self, text: &str, index: usize) -> Option<String> {
        self.chunk(text).into_iter().nth(index)
    }

    fn pack_sentences(&self, paragraph: &str, chunks: &mut Vec<String>) {
        let mut buf = String::new();
        let mut buf_len = 0usize;

        for sentence in split_sentences(paragraph) {
            if sentence.is_empty() {
                continue;
            }
            let sentence_len = char_len(sentence);

            // The +1 accounts for the joining space, even for an empty buffer.
            if buf_len + sentence_len + 1 <= self.chunk_chars {
                if !buf.is_empty() {
                    buf.push(' ');
                }
                buf.push_str(sentence);
                buf_len = char_len(&buf);
                continue;
            }

            if !buf.is_empty() {
                chunks.push(std::mem::take(&mut buf));
                buf_len = 0;
            }

            if sentence_len > self.chunk_chars {
                chunks.extend(self.windows(sentence).map(str::to_string));
            } else {
                buf.push_str(sentence);
                buf_len = sentence_len;
            }
        }

        if !buf.is_empty() {
            chunks.push(buf);
        }
    }

    /// Fixed-size windows over `text`, each trimmed, advancing by `stride()`.
    fn windows<'a>(&self, text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(iter::once(text.len()))
            .collect();
        let total = bounds.len() - 1;
        let size = self.chunk_chars;
        let stride = self.stride();

        let mut start = 0usize;
        let mut done = total == 0;
        iter::from_fn(move || {
            if done {
                return None;
            }
            let end = (start + size).min(total);
            let window = text[bounds[start]..bounds[end]].trim();
            if end >= total {
                done = true;
            } else {
                start += stride;
            }
            Some(window)
        })
    }
}

/// Chunks `text` with the given parameters. Shorthand for
/// `DocumentChunker::new(chunk_chars, overlap_chars).chunk(text)`.
pub fn chunk_text(text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<String> {
    DocumentChunker::new(chunk_chars, overlap_chars).chunk(text)
}

/// Blake3 hash of a chunk's text, hex encoded. Stored beside a vector at index
/// time, it lets query-time reconstruction detect drift.
pub fn chunk_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Splits after sentence-ending punctuation, dropping the whitespace run that
/// follows it.
fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    for mat in SENTENCE_BREAK.find_iter(paragraph) {
        // Punctuation is a single ASCII byte; keep it with the sentence.
        let cut = mat.start() + 1;
        sentences.push(&paragraph[start..cut]);
        start = mat.end();
    }
    sentences.push(&paragraph[start..]);
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_rejects_stalled_windows() {
        assert_eq!(
            DocumentChunker::checked(1500, 200),
            Ok(DocumentChunker::default())
        );
        assert!(DocumentChunker::checked(0, 0).is_err());
        assert_eq!(
            DocumentChunker::checked(200, 200),
            Err("overlap_chars (200) must be smaller than chunk_chars (200)".to_string())
        );
        assert!(DocumentChunker::checked(100, 500).is_err());
    }

    fn strip_ws(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn test_two_paragraphs_stay_whole() {
        let chunks = chunk_text("Paragraph one.\n\nParagraph two.", 1000, 200);
        assert_eq!(chunks, vec!["Paragraph one.", "Paragraph two."]);
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text("   \n\n \r\n\t ", 100, 10).is_empty());
    }

    #[test]
    fn test_crlf_paragraphs() {
        let chunks = chunk_text("First line\r\n\r\nSecond line\r\n", 100, 10);
        assert_eq!(chunks, vec!["First line", "Second line"]);
    }

    #[test]
    fn test_blank_line_with_spaces_splits() {
        let chunks = chunk_text("alpha\n   \nbeta", 100, 10);
        assert_eq!(chunks, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_split_sentences_keeps_punctuation() {
        let parts = split_sentences("One. Two?  Three!\nFour");
        assert_eq!(parts, vec!["One.", "Two?", "Three!", "Four"]);
    }

    #[test]
    fn test_split_sentences_ignores_inline_periods() {
        let parts = split_sentences("Version 1.2 is out. Next");
        assert_eq!(parts, vec!["Version 1.2 is out.", "Next"]);
    }

    #[test]
    fn test_oversized_paragraph_packs_sentences() {
        // 3 sentences of 9 chars; paragraph is 29 chars.
        let text = "Aaaa bbb. Cccc ddd. Eeee fff.";
        let chunks = chunk_text(text, 20, 5);
        assert_eq!(chunks, vec!["Aaaa bbb. Cccc ddd.", "Eeee fff."]);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20);
        }
    }

    #[test]
    fn test_packed_sentences_rejoin_with_single_space() {
        let text = "One one.\n  Two two.   Three three.";
        // Newline inside the paragraph is a whitespace run after punctuation.
        let chunks = chunk_text(text, 18, 0);
        assert_eq!(chunks, vec!["One one. Two two.", "Three three."]);
    }

    #[test]
    fn test_long_unit_is_windowed_with_overlap() {
        let text: String = ('a'..='z').collect();
        let chunks = chunk_text(&text, 10, 3);
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "hijklmnopq");
        assert_eq!(chunks[2], "opqrstuvwx");
        assert_eq!(chunks[3], "vwxyz");
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn test_windows_respect_multibyte_chars() {
        let text = "é".repeat(25);
        let chunks = chunk_text(&text, 10, 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 10);
            assert!(chunk.chars().all(|c| c == 'é'));
        }
        assert_eq!(chunks[0].chars().count(), 10);
    }

    #[test]
    fn test_overlap_not_smaller_than_chunk_still_terminates() {
        let text = "x".repeat(30);
        let chunks = chunk_text(&text, 5, 5);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
    }

    #[test]
    fn test_no_chunk_exceeds_limit() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            "Short intro.",
            "Word ".repeat(400),
            "Sentence number one is here. ".repeat(60)
        );
        for chunk in chunk_text(&text, 120, 30) {
            assert!(chunk.chars().count() <= 120, "chunk too long: {chunk:?}");
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta. Gamma delta? Epsilon!\n\nZeta eta theta. ".repeat(40);
        let first = chunk_text(&text, 200, 50);
        for _ in 0..5 {
            assert_eq!(chunk_text(&text, 200, 50), first);
        }
    }

    #[test]
    fn test_coverage_without_forced_windows() {
        let text = "The first point. The second point!\n\nA new paragraph? Yes. \
                    Another sentence follows here. And one more for good measure.";
        let chunks = chunk_text(text, 40, 10);
        let joined: String = chunks.iter().map(|c| strip_ws(c)).collect();
        assert_eq!(joined, strip_ws(text));
    }

    #[test]
    fn test_coverage_with_forced_windows() {
        // Consecutive zero-padded numbers: no whitespace, no repeated windows.
        let text: String = (0..200).map(|i| format!("{i:03}")).collect();
        let chunker = DocumentChunker::new(64, 16);
        let chunks = chunker.chunk(&text);

        let mut covered = vec![false; text.len()];
        let mut offset = 0usize;
        for chunk in &chunks {
            let start = text[offset..]
                .find(chunk.as_str())
                .map(|p| p + offset)
                .expect("window must be a substring at or after the previous one");
            for flag in &mut covered[start..start + chunk.len()] {
                *flag = true;
            }
            offset = start + 1;
        }
        assert!(covered.iter().all(|c| *c));
    }

    #[test]
    fn test_chunk_at_and_indices() {
        let chunker = DocumentChunker::new(1000, 200);
        let text = "A.\n\nB.\n\nC.";
        assert_eq!(chunker.chunk_at(text, 1).as_deref(), Some("B."));
        assert_eq!(chunker.chunk_at(text, 3), None);

        let indexed = chunker.chunks(text);
        assert_eq!(indexed.len(), 3);
        assert_eq!(indexed[2].index, 2);
        assert_eq!(indexed[2].hash(), chunk_hash("C."));
    }

    #[test]
    fn test_chunk_hash_is_stable_hex() {
        let h = chunk_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, chunk_hash("hello"));
        assert_ne!(h, chunk_hash("hello "));
    }
}
