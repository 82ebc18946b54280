//! Orchestration context: the pipeline registry and run dispatcher.
//!
//! A [`Worker`] is built explicitly at startup, has its pipelines registered
//! once, and is then shared by reference with whatever delivers trigger
//! events. [`Worker::shutdown`] stops it accepting runs and cancels the runs
//! in flight (their running stages still finish).
//!
//! ```rust,no_run
//! use edgequake_docflow::{Worker, WorkerConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), edgequake_docflow::DocflowError> {
//! let worker = Worker::with_default_workflows(WorkerConfig::default())?;
//! let results = worker
//!     .dispatch_event("invoice:process", json!({"invoice_id": "inv-1"}))
//!     .await;
//! assert_eq!(results.len(), 1);
//! let report = results.into_iter().next().unwrap()?;
//! println!("{} finished {}", report.pipeline, report.status);
//! worker.shutdown();
//! # Ok(())
//! # }
//! ```

use crate::audit::{AuditSink, JsonlAuditLog};
use crate::config::WorkerConfig;
use crate::error::DocflowError;
use crate::observer::{NoopObserver, SharedObserver};
use crate::pipeline::{execute, ExecutionOptions, Pipeline, PipelineDefinition, RunReport};
use crate::workflows::default_workflows;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

/// One trigger delivered to [`Worker::serve`], e.g. one NDJSON line
/// `{"event":"document:uploaded","data":{"document_id":"abc"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Totals for a [`Worker::serve`] session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServeSummary {
    pub events: usize,
    pub runs: usize,
    pub succeeded: usize,
    /// Runs that finished `failed` or `cancelled`.
    pub unsuccessful: usize,
    /// Runs that could not start, e.g. because the worker was shutting down.
    pub rejected: usize,
}

pub struct Worker {
    config: WorkerConfig,
    pipelines: Vec<Arc<Pipeline>>,
    audit: Option<Arc<dyn AuditSink>>,
    observer: SharedObserver,
    run_slots: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field(
                "pipelines",
                &self.pipelines.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Worker {
    /// Create a worker with no pipelines.
    ///
    /// Opens the audit log when `config.audit_log_path` is set.
    ///
    /// # Errors
    /// [`DocflowError::AuditWriteFailed`] if the audit log cannot be opened.
    pub fn new(config: WorkerConfig) -> Result<Self, DocflowError> {
        let audit: Option<Arc<dyn AuditSink>> = match &config.audit_log_path {
            Some(path) => Some(Arc::new(JsonlAuditLog::open(path)?)),
            None => None,
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            run_slots: Arc::new(Semaphore::new(config.max_runs.max(1))),
            config,
            pipelines: Vec::new(),
            audit,
            observer: Arc::new(NoopObserver),
            shutdown,
        })
    }

    /// A worker with the reference pipelines registered.
    pub fn with_default_workflows(config: WorkerConfig) -> Result<Self, DocflowError> {
        let mut worker = Self::new(config)?;
        for def in default_workflows(&worker.config) {
            worker.register(def)?;
        }
        Ok(worker)
    }

    /// Replace the audit sink (or the file log opened from the config).
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Validate and add a pipeline.
    ///
    /// # Errors
    /// [`DocflowError::DuplicatePipeline`] or any validation error from
    /// [`Pipeline::register`].
    pub fn register(&mut self, definition: PipelineDefinition) -> Result<Arc<Pipeline>, DocflowError> {
        if self.pipeline(&definition.name).is_some() {
            return Err(DocflowError::DuplicatePipeline {
                name: definition.name,
            });
        }
        let pipeline = Arc::new(Pipeline::register(definition)?);
        info!(
            pipeline = %pipeline.name(),
            stages = pipeline.len(),
            events = ?pipeline.events(),
            "Pipeline registered"
        );
        self.pipelines.push(pipeline.clone());
        Ok(pipeline)
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.iter().find(|p| p.name() == name).cloned()
    }

    /// Registered pipelines in registration order.
    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    /// Pipelines subscribed to `event`.
    pub fn subscribers(&self, event: &str) -> Vec<Arc<Pipeline>> {
        self.pipelines
            .iter()
            .filter(|p| p.events().iter().any(|e| e == event))
            .cloned()
            .collect()
    }

    /// Run pipeline `name` once with `input`.
    ///
    /// Waits for a free run slot when `max_runs` runs are already executing.
    ///
    /// # Errors
    /// [`DocflowError::UnknownPipeline`] or [`DocflowError::WorkerShutdown`].
    /// Stage failures are reported inside the returned [`RunReport`].
    pub async fn trigger(&self, name: &str, input: Value) -> Result<RunReport, DocflowError> {
        if self.is_shut_down() {
            return Err(DocflowError::WorkerShutdown);
        }
        let pipeline = self
            .pipeline(name)
            .ok_or_else(|| DocflowError::UnknownPipeline {
                name: name.to_string(),
            })?;

        let _slot = self
            .run_slots
            .acquire()
            .await
            .map_err(|_| DocflowError::WorkerShutdown)?;

        let mut options = ExecutionOptions::from_config(&self.config)
            .observer(self.observer.clone())
            .cancel_on(self.shutdown.subscribe());
        if let Some(sink) = &self.audit {
            options = options.audit(sink.clone());
        }

        Ok(execute(pipeline, input, options).await)
    }

    /// Run every pipeline subscribed to `event`, concurrently.
    ///
    /// Returns one result per subscribed pipeline, in registration order;
    /// an event nobody subscribes to yields an empty list. A run that cannot
    /// start (see [`Worker::trigger`]) does not disturb the others: runs
    /// already executing always finish and report.
    pub async fn dispatch_event(
        &self,
        event: &str,
        input: Value,
    ) -> Vec<Result<RunReport, DocflowError>> {
        let targets = self.subscribers(event);
        if targets.is_empty() {
            warn!(event, "No pipeline subscribed to event");
            return Vec::new();
        }
        info!(event, pipelines = targets.len(), "Dispatching event");
        let results = join_all(
            targets
                .iter()
                .map(|p| self.trigger(p.name(), input.clone())),
        )
        .await;
        for (pipeline, result) in targets.iter().zip(&results) {
            if let Err(e) = result {
                warn!(event, pipeline = %pipeline.name(), error = %e, "Run not started");
            }
        }
        results
    }

    /// Dispatch events from `events` until the stream ends, running up to
    /// `max_runs` events at once.
    ///
    /// Runs of events arriving after [`Worker::shutdown`] are counted as
    /// rejected.
    pub async fn serve<S>(&self, events: S) -> ServeSummary
    where
        S: Stream<Item = TriggerEvent>,
    {
        events
            .map(|e| async move { self.dispatch_event(&e.event, e.data).await })
            .buffer_unordered(self.config.max_runs.max(1))
            .fold(ServeSummary::default(), |mut summary, results| async move {
                summary.events += 1;
                for result in results {
                    match result {
                        Ok(report) => {
                            summary.runs += 1;
                            if report.is_success() {
                                summary.succeeded += 1;
                            } else {
                                summary.unsuccessful += 1;
                            }
                        }
                        Err(_) => summary.rejected += 1,
                    }
                }
                summary
            })
            .await
    }

    /// Stop accepting runs and cancel the runs in flight.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Worker shutting down");
        }
        self.run_slots.close();
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::error::StepError;
    use crate::pipeline::{step_fn, RunStatus, StageDefinition, StepContext};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> WorkerConfig {
        WorkerConfig::builder()
            .audit_log_path(None)
            .retry_backoff_ms(0)
            .build()
            .unwrap()
    }

    fn echo(name: &str, event: &str) -> PipelineDefinition {
        PipelineDefinition::new(name).on_event(event).stage(StageDefinition::new(
            "echo",
            step_fn(|_ctx: StepContext, v: Value| async move { Ok::<_, StepError>(v) }),
        ))
    }

    #[test]
    fn duplicate_pipeline_is_rejected() {
        let mut w = Worker::new(test_config()).unwrap();
        w.register(echo("p", "e")).unwrap();
        assert!(matches!(
            w.register(echo("p", "e")),
            Err(DocflowError::DuplicatePipeline { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_pipeline_is_an_error() {
        let w = Worker::new(test_config()).unwrap();
        assert!(matches!(
            w.trigger("nope", Value::Null).await,
            Err(DocflowError::UnknownPipeline { .. })
        ));
    }

    #[tokio::test]
    async fn event_runs_every_subscriber() {
        let mut w = Worker::new(test_config()).unwrap();
        w.register(echo("first", "thing:happened")).unwrap();
        w.register(echo("second", "thing:happened")).unwrap();
        w.register(echo("other", "other:event")).unwrap();

        let reports: Vec<RunReport> = w
            .dispatch_event("thing:happened", json!({"x": 1}))
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        let names: Vec<_> = reports.iter().map(|r| r.pipeline.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(reports.iter().all(|r| r.status == RunStatus::Succeeded));

        assert!(w.dispatch_event("unheard:of", Value::Null).await.is_empty());
    }

    #[tokio::test]
    async fn audit_sink_receives_events() {
        let audit = Arc::new(MemoryAuditLog::new());
        let mut w = Worker::new(test_config())
            .unwrap()
            .with_audit_sink(audit.clone());
        w.register(echo("p", "e")).unwrap();
        w.trigger("p", json!("payload")).await.unwrap();
        assert_eq!(audit.events().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_runs() {
        let mut w = Worker::new(test_config()).unwrap();
        w.register(echo("p", "e")).unwrap();
        w.shutdown();
        assert!(w.is_shut_down());
        assert!(matches!(
            w.trigger("p", Value::Null).await,
            Err(DocflowError::WorkerShutdown)
        ));
    }

    #[tokio::test]
    async fn serve_counts_runs_and_rejections() {
        let mut w = Worker::new(test_config()).unwrap();
        w.register(echo("ok", "go")).unwrap();
        w.register(PipelineDefinition::new("bad").on_event("go").stage(StageDefinition::new(
            "fail",
            step_fn(|_ctx: StepContext, _v: Value| async move {
                Err::<Value, _>(StepError::failed("nope"))
            }),
        )))
        .unwrap();

        let events = futures::stream::iter(vec![
            TriggerEvent { event: "go".into(), data: json!({}) },
            TriggerEvent { event: "nobody".into(), data: Value::Null },
        ]);
        let summary = w.serve(events).await;
        assert_eq!(summary.events, 2);
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.unsuccessful, 1);
        assert_eq!(summary.rejected, 0);

        w.shutdown();
        let summary = w
            .serve(futures::stream::iter(vec![TriggerEvent {
                event: "go".into(),
                data: Value::Null,
            }]))
            .await;
        // One rejection per subscribed pipeline.
        assert_eq!(summary.rejected, 2);
        assert_eq!(summary.runs, 0);
    }

    #[tokio::test]
    async fn max_runs_bounds_concurrent_runs() {
        let config = WorkerConfig::builder()
            .audit_log_path(None)
            .max_runs(2)
            .build()
            .unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, pk) = (running.clone(), peak.clone());
        let slow = step_fn(move |_ctx: StepContext, _v: Value| {
            let (r, pk) = (r.clone(), pk.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                pk.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, StepError>(Value::Null)
            }
        });
        let mut w = Worker::new(config).unwrap();
        w.register(PipelineDefinition::new("slow").stage(StageDefinition::new("s", slow)))
            .unwrap();

        let runs = (0..5).map(|_| w.trigger("slow", Value::Null));
        let reports = futures::future::try_join_all(runs).await.unwrap();
        assert_eq!(reports.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
