//! Configuration types for the docflow worker.
//!
//! All worker behaviour is controlled through [`WorkerConfig`], built via its
//! [`WorkerConfigBuilder`]. The same struct is handed to the analyzer, the
//! executor and the reference workflows so one value describes a whole worker.

use crate::error::DocflowError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for a single retry delay.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Configuration for a docflow worker.
///
/// Built via [`WorkerConfig::builder()`] or using [`WorkerConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_docflow::WorkerConfig;
///
/// let config = WorkerConfig::builder()
///     .storage_root("/var/lib/docflow/uploads")
///     .max_runs(4)
///     .retry_backoff_ms(0)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_runs, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Directory holding uploaded documents as `<document_id>.<extension>`.
    /// Default: `./storage/uploads`.
    pub storage_root: PathBuf,

    /// File extension of stored documents. Default: `pdf`.
    pub document_extension: String,

    /// NDJSON audit log. `None` disables the file sink. Default: `workflow-events.jsonl`.
    pub audit_log_path: Option<PathBuf>,

    /// Maximum number of pipeline runs executing at once on this worker. Default: 10.
    pub max_runs: usize,

    /// Maximum number of stages of one run executing at once. Default: 10.
    ///
    /// Wide fan-out stages beyond this limit wait for a free slot; they are
    /// already marked running, so they are never double-invoked. If the run
    /// is cancelled while a stage waits, it is skipped when the slot frees up
    /// and its handler is never called.
    pub max_concurrent_stages: usize,

    /// Initial retry delay in milliseconds. Doubles after every failed attempt,
    /// capped at 30 s. Default: 500. Zero disables the delay.
    pub retry_backoff_ms: u64,

    /// Path to libpdfium (file or containing directory). `None` uses the
    /// `PDFIUM_LIB_PATH` environment variable, then the system library.
    pub pdfium_library_path: Option<PathBuf>,

    /// Simulated work per step in the reference demo pipelines, in ms. Default: 0.
    pub step_latency_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage").join("uploads"),
            document_extension: "pdf".to_string(),
            audit_log_path: Some(PathBuf::from("workflow-events.jsonl")),
            max_runs: 10,
            max_concurrent_stages: 10,
            retry_backoff_ms: 500,
            pdfium_library_path: None,
            step_latency_ms: 0,
        }
    }
}

impl WorkerConfig {
    /// Create a new builder for `WorkerConfig`.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.retry_backoff_ms, attempt)
    }

    /// Simulated per-step latency for the demo pipelines.
    pub fn step_latency(&self) -> Duration {
        Duration::from_millis(self.step_latency_ms)
    }
}

/// `base_ms * 2^(attempt-1)`, capped at 30 s. Zero `base_ms` disables the delay.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

/// Builder for [`WorkerConfig`].
#[derive(Debug)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    pub fn document_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.document_extension = ext.into().trim_start_matches('.').to_string();
        self
    }

    pub fn audit_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.config.audit_log_path = path;
        self
    }

    pub fn max_runs(mut self, n: usize) -> Self {
        self.config.max_runs = n;
        self
    }

    pub fn max_concurrent_stages(mut self, n: usize) -> Self {
        self.config.max_concurrent_stages = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn step_latency_ms(mut self, ms: u64) -> Self {
        self.config.step_latency_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<WorkerConfig, DocflowError> {
        let c = &self.config;
        if c.max_runs == 0 {
            return Err(DocflowError::InvalidConfig("max_runs must be ≥ 1".into()));
        }
        if c.max_concurrent_stages == 0 {
            return Err(DocflowError::InvalidConfig(
                "max_concurrent_stages must be ≥ 1".into(),
            ));
        }
        if c.document_extension.is_empty() {
            return Err(DocflowError::InvalidConfig(
                "document_extension must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_worker() {
        let c = WorkerConfig::default();
        assert_eq!(c.max_runs, 10);
        assert_eq!(c.document_extension, "pdf");
        assert_eq!(c.storage_root, PathBuf::from("storage/uploads"));
        assert_eq!(
            c.audit_log_path.as_deref(),
            Some(std::path::Path::new("workflow-events.jsonl"))
        );
    }

    #[test]
    fn builder_rejects_zero_runs() {
        let err = WorkerConfig::builder().max_runs(0).build().unwrap_err();
        assert!(matches!(err, DocflowError::InvalidConfig(_)));
    }

    #[test]
    fn builder_strips_leading_dot_from_extension() {
        let c = WorkerConfig::builder()
            .document_extension(".pdf")
            .build()
            .unwrap();
        assert_eq!(c.document_extension, "pdf");
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let c = WorkerConfig::builder().retry_backoff_ms(500).build().unwrap();
        assert_eq!(c.retry_delay(1), Duration::from_millis(500));
        assert_eq!(c.retry_delay(2), Duration::from_millis(1000));
        assert_eq!(c.retry_delay(3), Duration::from_millis(2000));
        assert_eq!(c.retry_delay(20), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn zero_backoff_means_no_delay() {
        let c = WorkerConfig::builder().retry_backoff_ms(0).build().unwrap();
        assert_eq!(c.retry_delay(5), Duration::ZERO);
    }
}
