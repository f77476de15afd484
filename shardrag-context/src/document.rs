//! Best-effort text extraction from source documents.
//!
//! Reading a source never fails from the caller's point of view: an unreadable,
//! missing or malformed file yields an empty string and a log line.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

/// Extracts plain text from a document on disk.
pub trait DocumentReader: Send + Sync {
    /// Returns the document's text, or an empty string if it cannot be read.
    fn read_text(&self, path: &Path) -> String;
}

/// Environment variable holding the password for encrypted PDFs.
pub const ENV_PDF_PASSWORD: &str = "PDF_PASSWORD";

/// Reads PDFs through `pdf-extract` and everything else as lossy UTF-8.
///
/// Encrypted PDFs are opened with the configured password first, then with
/// the empty password.
#[derive(Debug, Clone, Default)]
pub struct FsDocumentReader {
    password: Option<String>,
}

impl FsDocumentReader {
    /// A reader using the password from `PDF_PASSWORD`, if set.
    pub fn new() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a reader using `lookup` to read environment variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            password: lookup(ENV_PDF_PASSWORD).filter(|p| !p.is_empty()),
        }
    }

    /// Set the PDF password (builder style)
    pub fn with_password(self, password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    fn is_pdf(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
    }

    fn read_pdf(&self, path: &Path) -> String {
        // pdf-extract panics on some malformed inputs; keep that inside the boundary.
        let extracted = panic::catch_unwind(AssertUnwindSafe(|| match &self.password {
            Some(password) => pdf_extract::extract_text_encrypted(path, password)
                .or_else(|e| {
                    tracing::debug!(
                        "Configured password did not open {}: {}",
                        path.display(),
                        e
                    );
                    pdf_extract::extract_text(path)
                }),
            None => pdf_extract::extract_text(path),
        }));
        match extracted {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!("Failed to extract text from {}: {}", path.display(), e);
                String::new()
            }
            Err(_) => {
                tracing::warn!("PDF extraction panicked for {}", path.display());
                String::new()
            }
        }
    }

    fn read_plain(path: &Path) -> String {
        match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", path.display(), e);
                String::new()
            }
        }
    }
}

impl DocumentReader for FsDocumentReader {
    fn read_text(&self, path: &Path) -> String {
        if !path.exists() {
            tracing::debug!("Source not found: {}", path.display());
            return String::new();
        }
        if Self::is_pdf(path) {
            self.read_pdf(path)
        } else {
            Self::read_plain(path)
        }
    }
}
