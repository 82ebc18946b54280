//! Content Analyzer: page count, text-vs-image classification and cost estimate.
//!
//! ## Data Flow
//!
//! ```text
//! document_id ──▶ store ──▶ parser ──▶ classify ──▶ cost / strategy
//!                 (bytes)   (pdfium)   (3 pages)    (pure)
//! ```
//!
//! 1. [`storage`] - resolve `<storage_root>/<document_id>.pdf` and read it
//! 2. [`pdf`] - count pages and extract text from the leading pages;
//!    runs in `spawn_blocking` because pdfium is not async-safe
//! 3. [`cost`] - floor-average the sampled characters, classify with a
//!    strict `> 100` threshold, price the document and pick a strategy
//!
//! The analyzer holds no shared lock while it works: concurrent analyses of
//! different documents only contend on the blocking thread pool.

pub mod cost;
pub mod pdf;
pub mod storage;

pub use cost::{
    classify_text, estimate_cost, PageSample, ProcessType, TextClassification, TEXT_SAMPLE_PAGES,
};
pub use pdf::{DocumentParser, DocumentProbe, PdfiumParser};
pub use storage::{DocumentStore, FsDocumentStore};

use crate::config::WorkerConfig;
use crate::error::DocflowError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Trigger payload identifying an uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInput {
    #[serde(alias = "id")]
    pub document_id: String,
    #[serde(default)]
    pub file_path: String,
}

impl DocumentInput {
    pub fn new(document_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            file_path: file_path.into(),
        }
    }
}

/// Outcome of one analysis. Immutable once returned.
///
/// Invariant: `process_type == Parallel` iff `page_count >= 10`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub document_id: String,
    pub page_count: usize,
    #[serde(alias = "file_size")]
    pub file_size_bytes: u64,
    pub process_type: ProcessType,
    pub estimated_cost: f64,
}

/// Signals reported alongside a result; not part of its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub is_text_based: bool,
    pub pages_sampled: usize,
    pub avg_chars_per_page: usize,
    pub analysis_time_ms: u64,
}

/// An [`AnalysisResult`] together with its [`ProcessingMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub result: AnalysisResult,
    pub metrics: ProcessingMetrics,
}

/// Analyse stored documents.
///
/// Cheap to clone; all clones share the same store and parser.
#[derive(Clone)]
pub struct ContentAnalyzer {
    store: Arc<dyn DocumentStore>,
    parser: Arc<dyn DocumentParser>,
}

impl std::fmt::Debug for ContentAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentAnalyzer")
            .field("store", &"<dyn DocumentStore>")
            .field("parser", &"<dyn DocumentParser>")
            .finish()
    }
}

impl ContentAnalyzer {
    pub fn new(store: Arc<dyn DocumentStore>, parser: Arc<dyn DocumentParser>) -> Self {
        Self { store, parser }
    }

    /// File-system store and pdfium parser as described by `config`.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            Arc::new(FsDocumentStore::new(
                config.storage_root.clone(),
                config.document_extension.clone(),
            )),
            Arc::new(PdfiumParser::new(config.pdfium_library_path.clone())),
        )
    }

    /// Analyse the stored document for `input.document_id`.
    ///
    /// `input.file_path` is informational; the bytes are always resolved
    /// from the id through the store.
    ///
    /// # Errors
    /// - [`DocflowError::NotFound`] / [`DocflowError::InvalidDocumentId`] - no bytes
    /// - [`DocflowError::ParseError`] - the bytes are not a well-formed PDF
    /// - [`DocflowError::PdfiumBindingFailed`] - no PDF engine available
    pub async fn analyze(&self, input: &DocumentInput) -> Result<AnalysisReport, DocflowError> {
        let analyzer = self.clone();
        let input = input.clone();
        tokio::task::spawn_blocking(move || analyzer.analyze_blocking(&input))
            .await
            .map_err(|e| DocflowError::Internal(format!("Analysis task panicked: {}", e)))?
    }

    /// Synchronous wrapper around [`ContentAnalyzer::analyze`].
    ///
    /// Creates a temporary tokio runtime internally.
    pub fn analyze_sync(&self, input: &DocumentInput) -> Result<AnalysisReport, DocflowError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| DocflowError::Internal(format!("Failed to create tokio runtime: {}", e)))?
            .block_on(self.analyze(input))
    }

    /// Blocking implementation of [`ContentAnalyzer::analyze`].
    pub fn analyze_blocking(&self, input: &DocumentInput) -> Result<AnalysisReport, DocflowError> {
        let start = Instant::now();
        info!(
            document_id = %input.document_id,
            file_path = %input.file_path,
            "Starting document analysis"
        );

        let path = self.store.locate(&input.document_id)?;
        let bytes = self.store.read(&input.document_id)?;
        let file_size_bytes = bytes.len() as u64;
        debug!(file_size = file_size_bytes, "Retrieved file size");

        let probe = self.parser.probe(&path, &bytes, TEXT_SAMPLE_PAGES)?;
        let classification = classify_text(&probe.samples);
        debug!(
            pages_checked = classification.pages_sampled,
            total_text_chars = classification.total_chars,
            avg_chars_per_page = classification.avg_chars_per_page,
            is_text_based = classification.is_text_based,
            "Text content analysis completed"
        );

        let result = AnalysisResult {
            document_id: input.document_id.clone(),
            page_count: probe.page_count,
            file_size_bytes,
            process_type: ProcessType::from_page_count(probe.page_count),
            estimated_cost: estimate_cost(
                probe.page_count,
                file_size_bytes,
                classification.is_text_based,
            ),
        };
        let metrics = ProcessingMetrics {
            is_text_based: classification.is_text_based,
            pages_sampled: classification.pages_sampled,
            avg_chars_per_page: classification.avg_chars_per_page,
            analysis_time_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            document_id = %result.document_id,
            page_count = result.page_count,
            file_size = result.file_size_bytes,
            process_type = %result.process_type,
            estimated_cost = result.estimated_cost,
            analysis_time = metrics.analysis_time_ms,
            is_text_based = metrics.is_text_based,
            "Document analysis completed"
        );

        Ok(AnalysisReport { result, metrics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    /// Parser returning a fixed probe, after checking the header like pdfium would.
    struct CannedParser(DocumentProbe);

    impl DocumentParser for CannedParser {
        fn probe(
            &self,
            source: &Path,
            bytes: &[u8],
            _sample_pages: usize,
        ) -> Result<DocumentProbe, DocflowError> {
            pdf::check_pdf_magic(source, bytes)?;
            Ok(self.0.clone())
        }
    }

    fn analyzer_with(dir: &Path, probe: DocumentProbe) -> ContentAnalyzer {
        ContentAnalyzer::new(
            Arc::new(FsDocumentStore::new(dir, "pdf")),
            Arc::new(CannedParser(probe)),
        )
    }

    fn write_doc(dir: &Path, id: &str, size: usize) -> PathBuf {
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.resize(size.max(bytes.len()), b' ');
        let path = dir.join(format!("{id}.pdf"));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn scanned_three_page_document() {
        let dir = tempfile::tempdir().unwrap();
        let size = 5 * 1_048_576;
        write_doc(dir.path(), "scan", size);
        let analyzer = analyzer_with(
            dir.path(),
            DocumentProbe {
                page_count: 3,
                samples: vec![PageSample::Text { chars: 0 }; 3],
            },
        );

        let report = analyzer
            .analyze(&DocumentInput::new("scan", "uploads/scan.pdf"))
            .await
            .unwrap();

        assert_eq!(report.result.page_count, 3);
        assert_eq!(report.result.file_size_bytes, size as u64);
        assert_eq!(report.result.process_type, ProcessType::Simple);
        assert!(!report.metrics.is_text_based);
        let expected = (0.10 + 0.15 + 5.0 * 0.02) * 1.5;
        assert!((report.result.estimated_cost - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn long_text_document_is_parallel() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(dir.path(), "book", 2048);
        let analyzer = analyzer_with(
            dir.path(),
            DocumentProbe {
                page_count: 10,
                samples: vec![PageSample::Text { chars: 1800 }; 3],
            },
        );

        let report = analyzer.analyze(&DocumentInput::new("book", "")).await.unwrap();
        assert_eq!(report.result.process_type, ProcessType::Parallel);
        assert!(report.metrics.is_text_based);
        assert_eq!(report.metrics.avg_chars_per_page, 1800);
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = analyzer_with(
            dir.path(),
            DocumentProbe {
                page_count: 1,
                samples: vec![],
            },
        );
        let err = analyzer
            .analyze(&DocumentInput::new("ghost", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DocflowError::NotFound { .. }));
    }

    #[tokio::test]
    async fn non_pdf_bytes_are_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.pdf"), b"just some text").unwrap();
        let analyzer = analyzer_with(
            dir.path(),
            DocumentProbe {
                page_count: 1,
                samples: vec![],
            },
        );
        let err = analyzer
            .analyze(&DocumentInput::new("notes", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DocflowError::ParseError { .. }));
    }

    #[tokio::test]
    async fn repeated_analysis_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(dir.path(), "same", 70_000);
        let analyzer = analyzer_with(
            dir.path(),
            DocumentProbe {
                page_count: 7,
                samples: vec![
                    PageSample::Text { chars: 90 },
                    PageSample::Unreadable,
                    PageSample::Text { chars: 400 },
                ],
            },
        );
        let input = DocumentInput::new("same", "");
        let a = analyzer.analyze(&input).await.unwrap();
        let b = analyzer.analyze(&input).await.unwrap();
        assert_eq!(a.result, b.result);
        assert_eq!(
            a.result.estimated_cost.to_bits(),
            b.result.estimated_cost.to_bits()
        );
    }

    #[test]
    fn input_accepts_legacy_id_field() {
        let input: DocumentInput =
            serde_json::from_str(r#"{"id":"abc","file_path":"x.pdf"}"#).unwrap();
        assert_eq!(input.document_id, "abc");
        let input: DocumentInput = serde_json::from_str(r#"{"document_id":"def"}"#).unwrap();
        assert_eq!(input.document_id, "def");
        assert_eq!(input.file_path, "");
    }

    #[test]
    fn result_serialises_process_type_as_string() {
        let result = AnalysisResult {
            document_id: "d".into(),
            page_count: 12,
            file_size_bytes: 10,
            process_type: ProcessType::Parallel,
            estimated_cost: 0.7,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["process_type"], "parallel");
        assert_eq!(json["file_size_bytes"], 10);
    }
}
