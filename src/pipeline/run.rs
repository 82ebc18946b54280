//! Per-run stage status table.
//!
//! Each stage owns one `AtomicU8`; every transition is a compare-and-set
//! from an expected status, so a stage can be claimed for running at most
//! once per run no matter how many completions race to recompute readiness.

use crate::pipeline::graph::Pipeline;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StageStatus {
    Pending = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Skipped = 4,
}

impl StageStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StageStatus::Pending,
            1 => StageStatus::Running,
            2 => StageStatus::Succeeded,
            3 => StageStatus::Failed,
            _ => StageStatus::Skipped,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Cancelled externally before completion, with no stage failed.
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of every stage of one run, indexed like [`Pipeline::stages`].
#[derive(Debug)]
pub struct RunState {
    statuses: Vec<AtomicU8>,
}

impl RunState {
    pub fn new(stage_count: usize) -> Self {
        Self {
            statuses: (0..stage_count)
                .map(|_| AtomicU8::new(StageStatus::Pending as u8))
                .collect(),
        }
    }

    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.len())
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn status(&self, stage: usize) -> StageStatus {
        StageStatus::from_u8(self.statuses[stage].load(Ordering::Acquire))
    }

    /// Move `stage` from `from` to `to`; false if it was not in `from`.
    pub fn try_transition(&self, stage: usize, from: StageStatus, to: StageStatus) -> bool {
        self.statuses[stage]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pending stages whose parents have all succeeded, in declaration order.
    pub fn ready_stages(&self, pipeline: &Pipeline) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.status(i) == StageStatus::Pending)
            .filter(|&i| {
                pipeline
                    .parent_indices(i)
                    .iter()
                    .all(|&p| self.status(p) == StageStatus::Succeeded)
            })
            .collect()
    }

    /// Ready stages successfully moved to `Running` by this caller.
    pub fn claim_ready(&self, pipeline: &Pipeline) -> Vec<usize> {
        self.ready_stages(pipeline)
            .into_iter()
            .filter(|&i| self.try_transition(i, StageStatus::Pending, StageStatus::Running))
            .collect()
    }

    /// Skip every pending descendant of `failed`. Returns the stages skipped
    /// by this call, in topological order.
    pub fn cascade_skip(&self, pipeline: &Pipeline, failed: usize) -> Vec<usize> {
        let descendants = pipeline.descendant_indices(failed);
        pipeline
            .order_indices()
            .iter()
            .copied()
            .filter(|i| descendants.contains(i))
            .filter(|&i| self.try_transition(i, StageStatus::Pending, StageStatus::Skipped))
            .collect()
    }

    /// Skip every stage that has not started yet.
    pub fn cancel_pending(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| self.try_transition(i, StageStatus::Pending, StageStatus::Skipped))
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        (0..self.len()).all(|i| self.status(i).is_terminal())
    }

    /// `Failed` if any stage failed, else `Cancelled` if the run was
    /// cancelled, else `Succeeded`.
    pub fn run_status(&self, cancelled: bool) -> RunStatus {
        if (0..self.len()).any(|i| self.status(i) == StageStatus::Failed) {
            RunStatus::Failed
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::pipeline::graph::{PipelineDefinition, StageDefinition};
    use crate::pipeline::step::step_fn;
    use serde_json::Value;
    use std::sync::Arc;

    fn diamond() -> Pipeline {
        let h = || step_fn(|_ctx, v: Value| async move { Ok::<_, StepError>(v) });
        Pipeline::register(
            PipelineDefinition::new("diamond")
                .stage(StageDefinition::new("a", h()))
                .stage(StageDefinition::new("b", h()).after(["a"]))
                .stage(StageDefinition::new("c", h()).after(["a"]))
                .stage(StageDefinition::new("d", h()).after(["b", "c"])),
        )
        .unwrap()
    }

    #[test]
    fn only_roots_are_ready_initially() {
        let p = diamond();
        let s = RunState::for_pipeline(&p);
        assert_eq!(s.ready_stages(&p), vec![0]);
    }

    #[test]
    fn claim_is_exclusive() {
        let p = diamond();
        let s = RunState::for_pipeline(&p);
        assert_eq!(s.claim_ready(&p), vec![0]);
        assert!(s.claim_ready(&p).is_empty());
        assert_eq!(s.status(0), StageStatus::Running);
    }

    #[test]
    fn fan_in_waits_for_every_parent() {
        let p = diamond();
        let s = RunState::for_pipeline(&p);
        s.claim_ready(&p);
        assert!(s.try_transition(0, StageStatus::Running, StageStatus::Succeeded));
        assert_eq!(s.claim_ready(&p), vec![1, 2]);

        assert!(s.try_transition(1, StageStatus::Running, StageStatus::Succeeded));
        assert!(s.ready_stages(&p).is_empty());
        assert!(s.try_transition(2, StageStatus::Running, StageStatus::Succeeded));
        assert_eq!(s.ready_stages(&p), vec![3]);
    }

    #[test]
    fn failure_skips_descendants_only() {
        let p = diamond();
        let s = RunState::for_pipeline(&p);
        s.claim_ready(&p);
        s.try_transition(0, StageStatus::Running, StageStatus::Succeeded);
        s.claim_ready(&p);
        s.try_transition(1, StageStatus::Running, StageStatus::Failed);

        assert_eq!(s.cascade_skip(&p, 1), vec![3]);
        assert_eq!(s.status(2), StageStatus::Running);
        s.try_transition(2, StageStatus::Running, StageStatus::Succeeded);

        assert!(s.all_terminal());
        assert_eq!(s.run_status(false), RunStatus::Failed);
        assert_eq!(s.run_status(true), RunStatus::Failed);
    }

    #[test]
    fn cancel_skips_pending_but_not_running() {
        let p = diamond();
        let s = RunState::for_pipeline(&p);
        s.claim_ready(&p);
        assert_eq!(s.cancel_pending(), vec![1, 2, 3]);
        assert_eq!(s.status(0), StageStatus::Running);
        assert!(!s.all_terminal());
        s.try_transition(0, StageStatus::Running, StageStatus::Succeeded);
        assert_eq!(s.run_status(true), RunStatus::Cancelled);
    }

    #[test]
    fn concurrent_claims_never_double_start() {
        let p = Arc::new(diamond());
        let s = Arc::new(RunState::for_pipeline(&p));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (p, s) = (p.clone(), s.clone());
                std::thread::spawn(move || s.claim_ready(&p))
            })
            .collect();
        let claimed: usize = handles.into_iter().map(|h| h.join().unwrap().len()).sum();
        assert_eq!(claimed, 1);
    }
}
