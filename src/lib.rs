//! # edgequake-docflow
//!
//! Document-ingestion pipelines as DAGs of typed stages, plus the PDF content
//! analysis that decides how a document should be processed.
//!
//! ## Pipeline Overview
//!
//! ```text
//! trigger event {document_id, file_path}
//!  │
//!  ├─ 1. Worker    find every pipeline subscribed to the event
//!  ├─ 2. Graph     validated DAG: no duplicates, no unknown parents, no cycles
//!  ├─ 3. Execute   ready stages run concurrently (JoinSet + semaphore),
//!  │               retried with exponential backoff
//!  ├─ 4. Cascade   a stage that exhausts its retries skips its descendants;
//!  │               independent branches keep going
//!  ├─ 5. Audit     STEP_STARTED / STEP_COMPLETED appended as NDJSON
//!  └─ 6. Report    per-stage status, timings and outputs
//! ```
//!
//! The `analyze-document` pipeline runs the [`analyzer`]: it counts pages via
//! pdfium, samples the first three pages for text, and derives a cost
//! estimate and a `simple` / `parallel` processing strategy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docflow::{Worker, WorkerConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WorkerConfig::builder()
//!         .storage_root("./storage/uploads")
//!         .build()?;
//!     let worker = Worker::with_default_workflows(config)?;
//!
//!     let report = worker
//!         .trigger("analyze-document", json!({"document_id": "report-2024", "file_path": ""}))
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docflow` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docflow = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyzer;
pub mod audit;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observer;
pub mod pipeline;
pub mod worker;
pub mod workflows;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyzer::{
    AnalysisReport, AnalysisResult, ContentAnalyzer, DocumentInput, ProcessType, ProcessingMetrics,
};
pub use audit::{read_events, AuditEvent, AuditEventType, AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use error::{DocflowError, StepError};
pub use metrics::{Health, RunMetrics};
pub use observer::{NoopObserver, RunObserver};
pub use pipeline::{
    execute, handler, step_fn, ExecutionOptions, Pipeline, PipelineDefinition, RunReport,
    RunStatus, StageDefinition, StageReport, StageStatus, Step, StepContext,
};
pub use worker::{ServeSummary, TriggerEvent, Worker};
