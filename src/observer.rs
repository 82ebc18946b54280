//! Callback trait for run progress events.
//!
//! Pass an [`Arc<dyn RunObserver>`] in [`crate::pipeline::ExecutionOptions`]
//! to receive events while a run executes. Callers can forward them to a
//! channel, a log or a terminal progress bar; the library does not care.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docflow::RunObserver;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct FailureCounter {
//!     failed: AtomicUsize,
//! }
//!
//! impl RunObserver for FailureCounter {
//!     fn on_stage_failed(&self, stage: &str, attempts: u32, error: &str) {
//!         self.failed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage} failed after {attempts} attempt(s): {error}");
//!     }
//! }
//! ```

use crate::pipeline::RunReport;
use std::sync::Arc;

/// Called by the executor as stages start and settle.
///
/// Stages of one run execute concurrently, so every method may be called
/// from several tasks at once. All methods default to no-ops.
pub trait RunObserver: Send + Sync {
    /// Called once before any stage starts.
    fn on_run_start(&self, run_id: &str, pipeline: &str, total_stages: usize) {
        let _ = (run_id, pipeline, total_stages);
    }

    /// Called before every attempt of a stage (`attempt` is 1-based).
    fn on_stage_start(&self, stage: &str, attempt: u32) {
        let _ = (stage, attempt);
    }

    /// Called when a stage succeeds.
    fn on_stage_complete(&self, stage: &str, run_time_ms: u64) {
        let _ = (stage, run_time_ms);
    }

    /// Called when a stage has exhausted its retry budget.
    fn on_stage_failed(&self, stage: &str, attempts: u32, error: &str) {
        let _ = (stage, attempts, error);
    }

    /// Called for every stage skipped by a failure cascade or cancellation.
    fn on_stage_skipped(&self, stage: &str) {
        let _ = stage;
    }

    /// Called once after every stage is terminal.
    fn on_run_complete(&self, report: &RunReport) {
        let _ = report;
    }
}

/// Observer that ignores every event. The default.
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

pub type SharedObserver = Arc<dyn RunObserver>;
