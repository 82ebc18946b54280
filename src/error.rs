//! Error types for the edgequake-docflow library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocflowError`] - **Fatal** for the operation that returned it: a
//!   pipeline definition that cannot be registered (cycle, duplicate stage,
//!   unknown parent), a document that cannot be analysed (missing file,
//!   malformed PDF), or a worker that was asked to run after shutdown.
//!
//! * [`StepError`] - **Non-fatal** for the run: a single stage attempt
//!   failed. The executor retries it per the stage's retry budget, then
//!   records it in [`crate::pipeline::StageReport`] and skips the stage's
//!   descendants. Independent branches keep running.
//!
//! Registration errors surface before any run starts; a `StepError` never
//! crashes the process.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docflow library.
///
/// Stage-level failures use [`StepError`] and are stored in the run report
/// rather than propagated here, except through [`DocflowError::StageFailure`]
/// when a caller explicitly asks for it via
/// [`crate::pipeline::RunReport::into_result`].
#[derive(Debug, Error)]
pub enum DocflowError {
    // ── Analysis errors ───────────────────────────────────────────────────
    /// The stored document for this id does not exist or cannot be read.
    #[error("Document not found: '{path}'\nCheck the storage root and document id.")]
    NotFound { path: PathBuf },

    /// The document id cannot be mapped onto a storage path.
    #[error("Invalid document id '{id}': expected letters, digits, '.', '_' or '-'")]
    InvalidDocumentId { id: String },

    /// The file exists but is not a well-formed PDF.
    #[error("Document '{path}' could not be parsed: {detail}")]
    ParseError { path: PathBuf, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install libpdfium on the system library path, or set\n\
PDFIUM_LIB_PATH / --pdfium-lib to the directory or file that contains it.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Pipeline definition errors ────────────────────────────────────────
    /// A stage was declared with an empty name.
    #[error("Pipeline '{pipeline}' declares a stage with an empty name")]
    EmptyStageName { pipeline: String },

    /// Two stages in one pipeline share a name.
    #[error("Pipeline '{pipeline}' declares stage '{stage}' more than once")]
    DuplicateStage { pipeline: String, stage: String },

    /// A stage names a parent that is not declared in the pipeline.
    #[error("Stage '{stage}' in pipeline '{pipeline}' depends on undeclared parent '{parent}'")]
    UnknownParent {
        pipeline: String,
        stage: String,
        parent: String,
    },

    /// The parent relation contains a cycle.
    #[error("Pipeline '{pipeline}' has a dependency cycle through stages: {}", stages.join(", "))]
    Cycle {
        pipeline: String,
        stages: Vec<String>,
    },

    /// A pipeline with this name is already registered on the worker.
    #[error("Pipeline '{name}' is already registered")]
    DuplicatePipeline { name: String },

    /// No pipeline with this name is registered on the worker.
    #[error("No pipeline named '{name}' is registered")]
    UnknownPipeline { name: String },

    // ── Runtime errors ────────────────────────────────────────────────────
    /// A stage exhausted its retry budget.
    ///
    /// Returned by [`crate::pipeline::RunReport::into_result`] when the
    /// caller wants to treat any stage failure as an error.
    #[error("Stage '{stage}' of pipeline '{pipeline}' failed after {attempts} attempt(s): {detail}")]
    StageFailure {
        pipeline: String,
        stage: String,
        attempts: u32,
        detail: String,
    },

    /// The worker has been shut down and no longer accepts runs.
    #[error("Worker is shutting down; no new runs are accepted")]
    WorkerShutdown,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not append to the audit log.
    #[error("Failed to write audit log '{path}': {source}")]
    AuditWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single stage attempt.
///
/// Stored in [`crate::pipeline::StageReport`] once the retry budget is
/// exhausted. Every variant is treated the same by the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum StepError {
    /// The handler reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The stage input (or a parent output) did not match the declared type.
    #[error("invalid stage input: {0}")]
    InvalidInput(String),

    /// The Content Analyzer failed for this document.
    #[error("document analysis failed: {0}")]
    Analysis(String),

    /// The handler panicked.
    #[error("stage handler panicked: {0}")]
    Panicked(String),
}

impl StepError {
    /// Shorthand for [`StepError::Failed`].
    pub fn failed(msg: impl Into<String>) -> Self {
        StepError::Failed(msg.into())
    }
}

impl From<DocflowError> for StepError {
    fn from(e: DocflowError) -> Self {
        StepError::Analysis(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_display_lists_stages() {
        let e = DocflowError::Cycle {
            pipeline: "p".into(),
            stages: vec!["a".into(), "b".into(), "c".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("a, b, c"), "got: {msg}");
    }

    #[test]
    fn unknown_parent_display() {
        let e = DocflowError::UnknownParent {
            pipeline: "p".into(),
            stage: "validate".into(),
            parent: "uplaod".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("validate"));
        assert!(msg.contains("uplaod"));
    }

    #[test]
    fn stage_failure_display() {
        let e = DocflowError::StageFailure {
            pipeline: "invoice".into(),
            stage: "store".into(),
            attempts: 4,
            detail: "timeout".into(),
        };
        assert!(e.to_string().contains("4 attempt(s)"));
    }

    #[test]
    fn analysis_errors_become_step_errors() {
        let e: StepError = DocflowError::NotFound {
            path: PathBuf::from("/tmp/x.pdf"),
        }
        .into();
        assert!(matches!(e, StepError::Analysis(ref m) if m.contains("/tmp/x.pdf")));
    }
}
