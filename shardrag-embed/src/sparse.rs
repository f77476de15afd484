//! Sparse term-frequency encoder used when the neural backend is unavailable.
//!
//! Vectors are term counts weighted by a smoothed inverse document frequency,
//! then L2-normalized. Two modes exist:
//!
//! - **fitted**: a vocabulary saved next to a shard (`vectorizer.json`) fixes the
//!   column layout, so query vectors line up with the shard's stored vectors.
//! - **unfitted**: the vocabulary is fitted on the texts being embedded. The
//!   dimension then depends on the input, and a search against a shard built
//!   with another layout fails the dimension check instead of returning noise.

use crate::error::{EmbedError, Result};
use crate::provider::{Embedder, l2_normalize};
use async_trait::async_trait;
use fnv::{FnvHashMap, FnvHashSet};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, LazyLock};

/// File name of the fitted vocabulary inside a shard directory.
pub const VOCABULARY_FILE: &str = "vectorizer.json";

/// Words of at least two word characters.
static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w\w+\b").unwrap());

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    TOKEN.find_iter(text).map(|m| m.as_str().to_lowercase())
}

/// A fitted term → column mapping with per-column IDF weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedVocabulary {
    vocabulary: BTreeMap<String, usize>,
    idf: Vec<f32>,
}

impl FittedVocabulary {
    /// Fits a vocabulary on `texts`. Columns are assigned in sorted term order.
    pub fn fit(texts: &[String]) -> Self {
        let mut document_frequency: BTreeMap<String, usize> = BTreeMap::new();
        for text in texts {
            let unique: FnvHashSet<String> = tokenize(text).collect();
            for term in unique {
                *document_frequency.entry(term).or_default() += 1;
            }
        }

        let n = texts.len() as f32;
        let mut vocabulary = BTreeMap::new();
        let mut idf = Vec::with_capacity(document_frequency.len());
        for (column, (term, df)) in document_frequency.into_iter().enumerate() {
            idf.push(((1.0 + n) / (1.0 + df as f32)).ln() + 1.0);
            vocabulary.insert(term, column);
        }

        Self { vocabulary, idf }
    }

    /// Loads a vocabulary artifact, checking that every column has a weight.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let vocabulary: Self =
            serde_json::from_slice(&bytes).map_err(|e| EmbedError::VocabularyLoad {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        vocabulary.check().map_err(|message| EmbedError::VocabularyLoad {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(vocabulary)
    }

    /// Writes the vocabulary atomically (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let json = serde_json::to_vec(self).map_err(|e| EmbedError::External { source: e.into() })?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| EmbedError::Io { source: e.error })?;
        Ok(())
    }

    fn check(&self) -> std::result::Result<(), String> {
        if let Some((term, &column)) = self.vocabulary.iter().find(|(_, c)| **c >= self.idf.len()) {
            return Err(format!(
                "term {term:?} maps to column {column} but only {} weights exist",
                self.idf.len()
            ));
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.idf.len()
    }

    pub fn len(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocabulary.is_empty()
    }

    /// TF-IDF vector for `text`, not yet normalized.
    fn transform(&self, text: &str) -> Vec<f32> {
        let mut counts: FnvHashMap<usize, f32> = FnvHashMap::default();
        for term in tokenize(text) {
            if let Some(&column) = self.vocabulary.get(&term) {
                *counts.entry(column).or_default() += 1.0;
            }
        }

        let mut vector = vec![0.0f32; self.dimension()];
        for (column, count) in counts {
            vector[column] = count * self.idf[column];
        }
        vector
    }

    /// Normalized vectors for `texts`; a text with no known terms is an error.
    fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|text| {
                let mut vector = self.transform(text);
                if l2_normalize(&mut vector) <= f32::EPSILON {
                    return Err(EmbedError::NoKnownTerms { text: text.clone() });
                }
                Ok(vector)
            })
            .collect()
    }
}

/// Term-frequency encoder, optionally bound to a fitted vocabulary.
#[derive(Debug, Clone, Default)]
pub struct SparseEncoder {
    vocabulary: Option<Arc<FittedVocabulary>>,
}

impl SparseEncoder {
    /// Encoder that fits a fresh vocabulary on every call.
    pub fn unfitted() -> Self {
        Self { vocabulary: None }
    }

    /// Encoder bound to a fixed vocabulary.
    pub fn fitted(vocabulary: Arc<FittedVocabulary>) -> Self {
        Self {
            vocabulary: Some(vocabulary),
        }
    }

    pub fn vocabulary(&self) -> Option<&FittedVocabulary> {
        self.vocabulary.as_deref()
    }
}

#[async_trait]
impl Embedder for SparseEncoder {
    async fn embed_texts(&self, texts: &[String], _batch_size: usize) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match &self.vocabulary {
            Some(vocabulary) if !vocabulary.is_empty() => vocabulary.embed_all(texts),
            _ => {
                tracing::debug!("Fitting sparse vocabulary on {} texts", texts.len());
                FittedVocabulary::fit(texts).embed_all(texts)
            }
        }
    }

    fn dimension(&self) -> Option<usize> {
        self.vocabulary
            .as_ref()
            .filter(|v| !v.is_empty())
            .map(|v| v.dimension())
    }

    fn name(&self) -> &str {
        "sparse-tfidf"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn corpus() -> Vec<String> {
        vec![
            "Aspirin reduces the risk of stroke.".to_string(),
            "Statins reduce cholesterol and the risk of stroke.".to_string(),
            "Metformin is first line for type 2 diabetes.".to_string(),
        ]
    }

    #[test]
    fn test_fit_sorts_columns_and_skips_short_tokens() {
        let vocab = FittedVocabulary::fit(&["b a cc bb".to_string()]);
        // single-character tokens are ignored
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.vocabulary.get("bb"), Some(&0));
        assert_eq!(vocab.vocabulary.get("cc"), Some(&1));
    }

    #[test]
    fn test_idf_is_smoothed() {
        let vocab = FittedVocabulary::fit(&corpus());
        let stroke = vocab.vocabulary["stroke"];
        let metformin = vocab.vocabulary["metformin"];
        // df(stroke) = 2, df(metformin) = 1, n = 3
        assert!((vocab.idf[stroke] - ((4.0f32 / 3.0).ln() + 1.0)).abs() < 1e-6);
        assert!((vocab.idf[metformin] - (2.0f32.ln() + 1.0)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_unfitted_vectors_are_normalized() {
        let encoder = SparseEncoder::unfitted();
        let vectors = encoder.embed_texts(&corpus(), 16).await.unwrap();
        assert_eq!(vectors.len(), 3);
        let dim = vectors[0].len();
        for v in &vectors {
            assert_eq!(v.len(), dim);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_fitted_keeps_dimension_stable() {
        let vocab = Arc::new(FittedVocabulary::fit(&corpus()));
        let encoder = SparseEncoder::fitted(vocab.clone());

        let query = encoder.embed_text("stroke risk").await.unwrap();
        assert_eq!(query.len(), vocab.dimension());
        assert_eq!(encoder.dimension(), Some(vocab.dimension()));

        let stored = encoder.embed_texts(&corpus(), 2).await.unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&query, &stored[0]) > dot(&query, &stored[2]));
    }

    #[tokio::test]
    async fn test_unknown_terms_are_an_error() {
        let vocab = Arc::new(FittedVocabulary::fit(&corpus()));
        let encoder = SparseEncoder::fitted(vocab);
        let err = encoder.embed_text("zebra quantum").await.unwrap_err();
        assert!(matches!(err, EmbedError::NoKnownTerms { .. }));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(VOCABULARY_FILE);
        let vocab = FittedVocabulary::fit(&corpus());

        vocab.save(&path).unwrap();
        let loaded = FittedVocabulary::load(&path).unwrap();
        assert_eq!(loaded, vocab);
    }

    #[test]
    fn test_load_rejects_inconsistent_artifact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(VOCABULARY_FILE);
        std::fs::write(&path, r#"{"vocabulary": {"stroke": 3}, "idf": [1.0]}"#).unwrap();
        assert!(matches!(
            FittedVocabulary::load(&path),
            Err(EmbedError::VocabularyLoad { .. })
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FittedVocabulary::load(&path),
            Err(EmbedError::VocabularyLoad { .. })
        ));
    }
}
