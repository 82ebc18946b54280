//! PDF probing via pdfium: page count plus text of the leading pages.
//!
//! ## Why a trait?
//!
//! [`DocumentParser`] is the seam between the analysis algorithm and the PDF
//! engine. The classification and cost logic only needs a page count and a
//! handful of character counts, so tests drive it with canned probes while
//! production binds the real pdfium library.
//!
//! ## Blocking
//!
//! pdfium keeps thread-local state and is CPU-bound. Callers run
//! [`DocumentParser::probe`] inside `tokio::task::spawn_blocking`; see
//! [`crate::analyzer::ContentAnalyzer::analyze`].

use crate::analyzer::cost::{sample_size, PageSample};
use crate::error::DocflowError;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Structural facts about a document needed for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentProbe {
    pub page_count: usize,
    /// One entry per sampled page, in page order.
    pub samples: Vec<PageSample>,
}

/// Parses document bytes into a [`DocumentProbe`].
pub trait DocumentParser: Send + Sync {
    /// Count pages and sample the text of the first `min(sample_pages, page_count)` pages.
    ///
    /// `source` is only used for error messages.
    ///
    /// # Errors
    /// [`DocflowError::ParseError`] when the bytes are not a well-formed document.
    fn probe(
        &self,
        source: &Path,
        bytes: &[u8],
        sample_pages: usize,
    ) -> Result<DocumentProbe, DocflowError>;
}

/// pdfium-backed [`DocumentParser`].
#[derive(Debug, Clone, Default)]
pub struct PdfiumParser {
    library_path: Option<PathBuf>,
}

impl PdfiumParser {
    /// Bind to the library at `library_path` (file or directory) when given,
    /// otherwise `PDFIUM_LIB_PATH`, otherwise the system library.
    pub fn new(library_path: Option<PathBuf>) -> Self {
        Self { library_path }
    }

    fn bind(&self) -> Result<Pdfium, DocflowError> {
        let explicit = self
            .library_path
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

        let bindings = match explicit {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&path))
            }
            Some(path) => Pdfium::bind_to_library(&path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| DocflowError::PdfiumBindingFailed(format!("{:?}", e)))?;

        Ok(Pdfium::new(bindings))
    }
}

impl DocumentParser for PdfiumParser {
    fn probe(
        &self,
        source: &Path,
        bytes: &[u8],
        sample_pages: usize,
    ) -> Result<DocumentProbe, DocflowError> {
        check_pdf_magic(source, bytes)?;

        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| DocflowError::ParseError {
                path: source.to_path_buf(),
                detail: format!("{:?}", e),
            })?;

        let pages = document.pages();
        let page_count = pages.len() as usize;
        debug!("PDF loaded: {} pages", page_count);

        let to_sample = sample_size(page_count).min(sample_pages);
        let mut samples = Vec::with_capacity(to_sample);

        for idx in 0..to_sample {
            let extracted = pages
                .get(idx as PdfPageIndex)
                .and_then(|page| {
                    let text = page.text()?;
                    Ok(text.all())
                });
            let sample = match extracted {
                Ok(text) => PageSample::Text { chars: text.len() },
                Err(e) => {
                    warn!("Failed to extract text from page {}: {:?}", idx + 1, e);
                    PageSample::Unreadable
                }
            };
            samples.push(sample);
        }

        Ok(DocumentProbe {
            page_count,
            samples,
        })
    }
}

/// Reject anything that does not start with the `%PDF` header.
pub fn check_pdf_magic(source: &Path, bytes: &[u8]) -> Result<(), DocflowError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(DocflowError::ParseError {
            path: source.to_path_buf(),
            detail: format!("not a PDF (first bytes: {:?})", magic),
        });
    }
    Ok(())
}
