//! Outcome of a pipeline run.

use crate::error::{DocflowError, StepError};
use crate::pipeline::run::{RunStatus, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    /// Attempts made; 0 for skipped stages.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_time_ms: Option<u64>,
    /// Error of the last attempt, for failed stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

impl StageReport {
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

/// Result of [`crate::pipeline::execute`].
///
/// `stages` are in declaration order. A run that reports `Failed` still
/// carries the outputs of every stage that succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn status_of(&self, name: &str) -> Option<StageStatus> {
        self.stage(name).map(|s| s.status)
    }

    fn names_with(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn completed_stages(&self) -> Vec<&str> {
        self.names_with(StageStatus::Succeeded)
    }

    pub fn failed_stages(&self) -> Vec<&str> {
        self.names_with(StageStatus::Failed)
    }

    pub fn skipped_stages(&self) -> Vec<&str> {
        self.names_with(StageStatus::Skipped)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Treat any failed stage as an error.
    ///
    /// # Errors
    /// [`DocflowError::StageFailure`] for the first failed stage in
    /// declaration order.
    pub fn into_result(self) -> Result<RunReport, DocflowError> {
        match self
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
        {
            Some(failed) => Err(DocflowError::StageFailure {
                pipeline: self.pipeline.clone(),
                stage: failed.name.clone(),
                attempts: failed.attempts,
                detail: failed
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}
