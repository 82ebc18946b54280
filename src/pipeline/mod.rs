//! Pipeline Graph Model and Step Execution Contract.
//!
//! Each submodule owns one concern so the graph rules, the status table and
//! the scheduler can be tested on their own.
//!
//! ## Data Flow
//!
//! ```text
//! PipelineDefinition ──▶ Pipeline::register ──▶ execute ──▶ RunReport
//!   (stages, parents)     (validate, freeze)    (RunState,   (statuses,
//!                                                JoinSet)     outputs)
//! ```
//!
//! 1. [`step`] - the typed [`Step`] trait and its JSON-erased [`StageHandler`]
//! 2. [`graph`] - declarations, validation (duplicates, unknown parents,
//!    cycles) and graph queries such as parallel-group detection
//! 3. [`run`] - per-run status table with compare-and-set transitions
//! 4. [`executor`] - concurrent scheduling, retries with backoff, failure
//!    cascade and cancellation
//! 5. [`report`] - terminal statuses, timings and outputs of a run
//!
//! ## Failure propagation
//!
//! A stage runs only once every parent has succeeded. When a stage exhausts
//! its retry budget, every pending descendant is marked `skipped`; stages in
//! independent branches keep running. A run is `failed` if any stage failed.

pub mod executor;
pub mod graph;
pub mod report;
pub mod run;
pub mod step;

pub use executor::{execute, ExecutionOptions};
pub use graph::{ParallelGroup, Pipeline, PipelineDefinition, StageDefinition, StageRegistration};
pub use report::{RunReport, StageReport};
pub use run::{RunState, RunStatus, StageStatus};
pub use step::{handler, step_fn, FnStep, StageHandler, Step, StepContext};
