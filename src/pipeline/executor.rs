//! Run a validated pipeline to completion.
//!
//! ## Scheduling
//!
//! A single coordinator loop owns the run. It claims every ready stage
//! (`Pending → Running` by compare-and-set), spawns one task per claimed
//! stage into a `JoinSet`, and settles each stage as its task finishes:
//!
//! ```text
//!  claim_ready ──▶ spawn ──▶ join_next ──▶ settle ──┐
//!       ▲                                          │
//!       └──────────────────────────────────────────┘
//! ```
//!
//! Settling a success stores the output for the stage's children and marks
//! it `Succeeded`; settling a failure marks it `Failed` and skips its pending
//! descendants. Sibling tasks are never aborted. A semaphore bounds how many
//! stage bodies execute at once.
//!
//! ## Cancellation
//!
//! When the cancel signal flips to `true`, pending stages are skipped and no
//! new stage or retry attempt starts. Stages already running finish and keep
//! their real outcome. A claimed stage still waiting for a concurrency slot
//! has not started: it is skipped once it gets the slot, and a stage
//! sleeping between retries stops with its last error.

use crate::audit::{AuditEvent, AuditSink};
use crate::config::{backoff_delay, WorkerConfig};
use crate::error::StepError;
use crate::observer::{NoopObserver, SharedObserver};
use crate::pipeline::graph::Pipeline;
use crate::pipeline::report::{RunReport, StageReport};
use crate::pipeline::run::{RunState, StageStatus};
use crate::pipeline::step::StepContext;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Per-run execution settings.
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Run id used for correlation. Default: a fresh UUID v4.
    pub run_id: Option<String>,
    pub max_concurrent_stages: usize,
    pub retry_backoff_ms: u64,
    pub audit: Option<Arc<dyn AuditSink>>,
    pub observer: SharedObserver,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("run_id", &self.run_id)
            .field("max_concurrent_stages", &self.max_concurrent_stages)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("audit", &self.audit.as_ref().map(|_| "<dyn AuditSink>"))
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

impl ExecutionOptions {
    /// Concurrency and backoff from `config`; no audit sink, no observer.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            run_id: None,
            max_concurrent_stages: config.max_concurrent_stages,
            retry_backoff_ms: config.retry_backoff_ms,
            audit: None,
            observer: Arc::new(NoopObserver),
            cancel: None,
        }
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn max_concurrent_stages(mut self, n: usize) -> Self {
        self.max_concurrent_stages = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Cancel the run when the channel's value becomes `true`.
    ///
    /// Create the pair with `tokio::sync::watch::channel(false)`.
    pub fn cancel_on(mut self, rx: watch::Receiver<bool>) -> Self {
        self.cancel = Some(rx);
        self
    }
}

/// State shared by the coordinator and every stage task of one run.
struct RunShared {
    run_id: String,
    pipeline: Arc<Pipeline>,
    input: Arc<Value>,
    audit: Option<Arc<dyn AuditSink>>,
    observer: SharedObserver,
    retry_backoff_ms: u64,
    slots: Arc<Semaphore>,
    cancel: Option<watch::Receiver<bool>>,
}

impl RunShared {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    fn record(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            if let Err(e) = sink.record(&event) {
                warn!(
                    step = %event.step,
                    event_type = event.event_type.as_str(),
                    error = %e,
                    "Failed to record audit event"
                );
            }
        }
    }
}

/// What a stage task hands back to the coordinator.
enum StageOutcome {
    Finished {
        index: usize,
        attempts: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        run_time_ms: u64,
        result: Result<Value, StepError>,
    },
    /// Cancelled while waiting for a concurrency slot; never invoked.
    NotStarted { index: usize },
}

#[derive(Debug, Clone, Default)]
struct StageRecord {
    attempts: u32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    run_time_ms: Option<u64>,
    error: Option<StepError>,
    output: Option<Value>,
}

/// Execute one run of `pipeline` with `input` as the trigger payload.
///
/// Never fails as a whole: stage failures are recorded in the returned
/// [`RunReport`]. Use [`RunReport::into_result`] to turn them into an error.
pub async fn execute(pipeline: Arc<Pipeline>, input: Value, options: ExecutionOptions) -> RunReport {
    let run_id = options
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let span = info_span!("run", run_id = %run_id, pipeline = %pipeline.name());
    drive(pipeline, input, options, run_id).instrument(span).await
}

async fn drive(
    pipeline: Arc<Pipeline>,
    input: Value,
    options: ExecutionOptions,
    run_id: String,
) -> RunReport {
    let started_at = Utc::now();
    let clock = Instant::now();
    let observer = options.observer.clone();
    let shared = Arc::new(RunShared {
        run_id: run_id.clone(),
        pipeline: pipeline.clone(),
        input: Arc::new(input),
        audit: options.audit.clone(),
        observer: observer.clone(),
        retry_backoff_ms: options.retry_backoff_ms,
        slots: Arc::new(Semaphore::new(options.max_concurrent_stages.max(1))),
        cancel: options.cancel.clone(),
    });

    let state = RunState::for_pipeline(&pipeline);
    let mut records = vec![StageRecord::default(); pipeline.len()];
    let mut join_set: JoinSet<StageOutcome> = JoinSet::new();
    let mut cancel_rx = options.cancel;
    let mut cancelled = shared.is_cancelled();

    info!(stages = pipeline.len(), "Run started");
    observer.on_run_start(&run_id, pipeline.name(), pipeline.len());

    if cancelled {
        skip_pending(&state, &pipeline, &observer);
    }

    loop {
        if !cancelled && shared.is_cancelled() {
            cancelled = true;
            warn!("Run cancelled; stages that have not started will be skipped");
            skip_pending(&state, &pipeline, &observer);
        }
        if !cancelled {
            for i in state.claim_ready(&pipeline) {
                let parents: HashMap<String, Value> = pipeline
                    .parent_indices(i)
                    .iter()
                    .filter_map(|&p| {
                        records[p]
                            .output
                            .clone()
                            .map(|out| (pipeline.stage_name(p).to_string(), out))
                    })
                    .collect();
                join_set.spawn(run_stage(shared.clone(), i, Arc::new(parents)).in_current_span());
            }
        }

        if join_set.is_empty() {
            break;
        }

        tokio::select! {
            _ = wait_for_cancel(&mut cancel_rx), if !cancelled => {
                cancelled = true;
                warn!("Run cancelled; stages that have not started will be skipped");
                skip_pending(&state, &pipeline, &observer);
            }
            Some(joined) = join_set.join_next() => {
                match joined {
                    Ok(outcome) => settle(outcome, &state, &pipeline, &mut records, &observer),
                    Err(e) => error!("Stage task did not complete: {}", e),
                }
            }
        }
    }

    // A task lost to a JoinError leaves its stage running; close it out.
    for (i, record) in records.iter_mut().enumerate() {
        if state.try_transition(i, StageStatus::Running, StageStatus::Failed) {
            record.error = Some(StepError::Panicked("stage task aborted".into()));
        }
    }

    let status = state.run_status(cancelled);
    let stages: Vec<StageReport> = records
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            let name = pipeline.stage_name(i);
            StageReport {
                name: name.to_string(),
                status: state.status(i),
                attempts: r.attempts,
                started_at: r.started_at,
                finished_at: r.finished_at,
                run_time_ms: r.run_time_ms,
                error: r.error,
                output: r.output,
                parallel_group: pipeline.parallel_group_of(name).map(str::to_string),
            }
        })
        .collect();

    let report = RunReport {
        run_id,
        pipeline: pipeline.name().to_string(),
        status,
        started_at,
        finished_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
        stages,
    };

    info!(
        status = %report.status,
        duration_ms = report.duration_ms,
        succeeded = report.completed_stages().len(),
        failed = report.failed_stages().len(),
        skipped = report.skipped_stages().len(),
        "Run finished"
    );
    observer.on_run_complete(&report);
    report
}

fn settle(
    outcome: StageOutcome,
    state: &RunState,
    pipeline: &Pipeline,
    records: &mut [StageRecord],
    observer: &SharedObserver,
) {
    let (i, attempts, started_at, finished_at, run_time_ms, result) = match outcome {
        StageOutcome::Finished {
            index,
            attempts,
            started_at,
            finished_at,
            run_time_ms,
            result,
        } => (index, attempts, started_at, finished_at, run_time_ms, result),
        StageOutcome::NotStarted { index } => {
            if state.try_transition(index, StageStatus::Running, StageStatus::Skipped) {
                let name = pipeline.stage_name(index);
                info!(stage = name, "Skipping stage; run cancelled before it got a slot");
                observer.on_stage_skipped(name);
            }
            return;
        }
    };

    let name = pipeline.stage_name(i);
    let record = &mut records[i];
    record.attempts = attempts;
    record.started_at = Some(started_at);
    record.finished_at = Some(finished_at);
    record.run_time_ms = Some(run_time_ms);

    match result {
        Ok(output) => {
            state.try_transition(i, StageStatus::Running, StageStatus::Succeeded);
            record.output = Some(output);
            debug!(stage = name, run_time_ms, "Stage succeeded");
            observer.on_stage_complete(name, run_time_ms);
        }
        Err(err) => {
            state.try_transition(i, StageStatus::Running, StageStatus::Failed);
            observer.on_stage_failed(name, attempts, &err.to_string());
            record.error = Some(err);
            for skipped in state.cascade_skip(pipeline, i) {
                let skipped = pipeline.stage_name(skipped);
                info!(stage = skipped, failed_ancestor = name, "Skipping stage");
                observer.on_stage_skipped(skipped);
            }
        }
    }
}

fn skip_pending(state: &RunState, pipeline: &Pipeline, observer: &SharedObserver) {
    for i in state.cancel_pending() {
        observer.on_stage_skipped(pipeline.stage_name(i));
    }
}

/// Resolves once the cancel signal is `true`; never resolves without a signal.
async fn wait_for_cancel(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
            if closed {
                // Sender dropped without cancelling.
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Invoke one stage with its retry budget.
async fn run_stage(
    shared: Arc<RunShared>,
    index: usize,
    parents: Arc<HashMap<String, Value>>,
) -> StageOutcome {
    let stage = shared.pipeline.stage_at(index);
    let name = stage.name.as_str();

    let _slot = match shared.slots.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            let now = Utc::now();
            return StageOutcome::Finished {
                index,
                attempts: 0,
                started_at: now,
                finished_at: now,
                run_time_ms: 0,
                result: Err(StepError::failed(format!("no stage slot available: {}", e))),
            };
        }
    };
    if shared.is_cancelled() {
        return StageOutcome::NotStarted { index };
    }

    let started_at = Utc::now();
    let clock = Instant::now();
    let max_attempts = stage.retries.saturating_add(1);
    let mut attempt = 0u32;

    let result = loop {
        attempt += 1;
        shared.record(AuditEvent::started(name, (*shared.input).clone()));
        shared.observer.on_stage_start(name, attempt);
        debug!(stage = name, attempt, max_attempts, "Invoking stage");

        let ctx = StepContext::new(
            shared.run_id.as_str(),
            shared.pipeline.name(),
            name,
            attempt,
            shared.input.clone(),
            parents.clone(),
        );
        let invocation = AssertUnwindSafe(stage.handler.invoke(ctx, (*shared.input).clone()))
            .catch_unwind()
            .await;
        let result =
            invocation.unwrap_or_else(|panic| Err(StepError::Panicked(panic_message(panic))));

        match result {
            Ok(output) => {
                shared.record(AuditEvent::completed(name, output.clone()));
                break Ok(output);
            }
            Err(err) if attempt < max_attempts && !shared.is_cancelled() => {
                let delay = backoff_delay(shared.retry_backoff_ms, attempt);
                warn!(
                    stage = name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Stage attempt failed, will retry"
                );
                let mut cancel = shared.cancel.clone();
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(delay) => shared.is_cancelled(),
                    _ = wait_for_cancel(&mut cancel) => true,
                };
                if cancelled {
                    warn!(
                        stage = name,
                        attempts = attempt,
                        error = %err,
                        "Run cancelled during retry backoff; stage failed"
                    );
                    break Err(err);
                }
            }
            Err(err) => {
                error!(stage = name, attempts = attempt, error = %err, "Stage failed");
                break Err(err);
            }
        }
    };

    StageOutcome::Finished {
        index,
        attempts: attempt,
        started_at,
        finished_at: Utc::now(),
        run_time_ms: clock.elapsed().as_millis() as u64,
        result,
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditLog};
    use crate::pipeline::graph::{PipelineDefinition, StageDefinition};
    use crate::pipeline::run::RunStatus;
    use crate::pipeline::step::{step_fn, StageHandler};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ok() -> Arc<dyn StageHandler> {
        step_fn(|ctx: StepContext, _input: Value| async move {
            Ok::<_, StepError>(json!({ "stage": ctx.stage }))
        })
    }

    fn failing(msg: &'static str) -> Arc<dyn StageHandler> {
        step_fn(move |_ctx: StepContext, _input: Value| async move {
            Err::<Value, _>(StepError::failed(msg))
        })
    }

    fn options() -> ExecutionOptions {
        ExecutionOptions::default().retry_backoff_ms(0)
    }

    #[tokio::test]
    async fn linear_chain_passes_parent_outputs() {
        let double = step_fn(|ctx: StepContext, _input: Value| async move {
            let n: u64 = ctx.parent_output("seed")?;
            Ok::<_, StepError>(n * 2)
        });
        let seed = step_fn(|_ctx: StepContext, input: Value| async move {
            Ok::<_, StepError>(input["n"].as_u64().unwrap_or(0))
        });
        let pipeline = Pipeline::register(
            PipelineDefinition::new("chain")
                .stage(StageDefinition::new("seed", seed))
                .stage(StageDefinition::new("double", double).after(["seed"])),
        )
        .unwrap();

        let report = execute(Arc::new(pipeline), json!({"n": 21}), options()).await;
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.stage("double").unwrap().output, Some(json!(42)));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = step_fn(move |ctx: StepContext, _input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    Err(StepError::failed("transient"))
                } else {
                    Ok(json!("done"))
                }
            }
        });
        let pipeline = Pipeline::register(
            PipelineDefinition::new("flaky").stage(StageDefinition::new("s", flaky).retries(3)),
        )
        .unwrap();

        let audit = Arc::new(MemoryAuditLog::new());
        let report = execute(
            Arc::new(pipeline),
            json!({}),
            options().audit(audit.clone()),
        )
        .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.stage("s").unwrap().attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let starts = audit
            .events()
            .iter()
            .filter(|e| e.event_type == AuditEventType::StepStarted)
            .count();
        assert_eq!(starts, 3);
    }

    #[tokio::test]
    async fn exhausted_budget_fails_stage() {
        let pipeline = Pipeline::register(
            PipelineDefinition::new("p")
                .stage(StageDefinition::new("s", failing("nope")).retries(2))
                .stage(StageDefinition::new("after", ok()).after(["s"])),
        )
        .unwrap();

        let report = execute(Arc::new(pipeline), Value::Null, options()).await;
        let s = report.stage("s").unwrap();
        assert_eq!(s.status, StageStatus::Failed);
        assert_eq!(s.attempts, 3);
        assert_eq!(s.error, Some(StepError::failed("nope")));
        assert_eq!(report.status_of("after"), Some(StageStatus::Skipped));
        assert_eq!(report.stage("after").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn panics_become_stage_failures() {
        let boom = step_fn(|_ctx: StepContext, _input: Value| async move {
            if true {
                panic!("handler exploded");
            }
            Ok::<Value, StepError>(Value::Null)
        });
        let pipeline = Pipeline::register(
            PipelineDefinition::new("p").stage(StageDefinition::new("boom", boom)),
        )
        .unwrap();

        let report = execute(Arc::new(pipeline), Value::Null, options()).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            report.stage("boom").unwrap().error,
            Some(StepError::Panicked("handler exploded".into()))
        );
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let make = || {
            let (running, peak) = (running.clone(), peak.clone());
            step_fn(move |_ctx: StepContext, _input: Value| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, StepError>(Value::Null)
                }
            })
        };
        let mut def = PipelineDefinition::new("wide").stage(StageDefinition::new("root", ok()));
        for i in 0..6 {
            def = def.stage(StageDefinition::new(format!("leaf-{i}"), make()).after(["root"]));
        }
        let pipeline = Pipeline::register(def).unwrap();

        let report = execute(
            Arc::new(pipeline),
            Value::Null,
            options().max_concurrent_stages(2),
        )
        .await;
        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(
            report.stage("leaf-3").unwrap().parallel_group.as_deref(),
            Some("parallel-root")
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_everything() {
        let pipeline = Pipeline::register(
            PipelineDefinition::new("p")
                .stage(StageDefinition::new("a", ok()))
                .stage(StageDefinition::new("b", ok()).after(["a"])),
        )
        .unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = execute(Arc::new(pipeline), Value::Null, options().cancel_on(rx)).await;
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.skipped_stages(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_pipeline_succeeds() {
        let pipeline = Pipeline::register(PipelineDefinition::new("empty")).unwrap();
        let report = execute(Arc::new(pipeline), Value::Null, options().run_id("fixed")).await;
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.run_id, "fixed");
        assert!(report.stages.is_empty());
    }
}
