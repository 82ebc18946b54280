//! CLI binary for edgequake-docflow.
//!
//! A thin shim over the library crate that maps CLI flags to `WorkerConfig`,
//! drives the worker and prints reports.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use edgequake_docflow::{
    read_events, ContentAnalyzer, DocumentInput, Health, RunMetrics, RunObserver, RunReport,
    RunStatus, StageStatus, TriggerEvent, Worker, WorkerConfig,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Notify;
use tokio_stream::wrappers::LinesStream;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI run observer using indicatif ─────────────────────────────────────────

/// Terminal observer: one progress bar over every stage of every run started
/// by this process, plus a log line per settled stage. Stages of concurrent
/// runs settle in any order, so the bar only ever grows and increments.
///
/// Also keeps the finished reports so the caller can print run metrics.
struct CliRunObserver {
    bar: Option<ProgressBar>,
    reports: Mutex<Vec<RunReport>>,
}

impl CliRunObserver {
    fn new(show_progress: bool) -> Arc<Self> {
        let bar = show_progress.then(|| {
            let bar = ProgressBar::new(0);
            let style = ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} stages  ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS);
            bar.set_style(style);
            bar.set_prefix("Running");
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        Arc::new(Self {
            bar,
            reports: Mutex::new(Vec::new()),
        })
    }

    fn println(&self, line: String) {
        if let Some(bar) = &self.bar {
            bar.println(line);
        }
    }

    fn advance(&self) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }

    fn reports(&self) -> Vec<RunReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl RunObserver for CliRunObserver {
    fn on_run_start(&self, run_id: &str, pipeline: &str, total_stages: usize) {
        if let Some(bar) = &self.bar {
            bar.inc_length(total_stages as u64);
        }
        self.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(pipeline),
            dim(&format!("run {run_id}, {total_stages} stages")),
        ));
    }

    fn on_stage_start(&self, stage: &str, attempt: u32) {
        if let Some(bar) = &self.bar {
            if attempt > 1 {
                bar.set_message(format!("{stage} (attempt {attempt})"));
            } else {
                bar.set_message(stage.to_string());
            }
        }
    }

    fn on_stage_complete(&self, stage: &str, run_time_ms: u64) {
        self.println(format!(
            "  {} {:<24} {}",
            green("✓"),
            stage,
            dim(&format!("{:.1}s", run_time_ms as f64 / 1000.0)),
        ));
        self.advance();
    }

    fn on_stage_failed(&self, stage: &str, attempts: u32, error: &str) {
        let msg = if error.len() > 80 {
            let cut = (0..=79).rev().find(|&i| error.is_char_boundary(i)).unwrap_or(0);
            format!("{}\u{2026}", &error[..cut])
        } else {
            error.to_string()
        };
        self.println(format!(
            "  {} {:<24} {}  {}",
            red("✗"),
            stage,
            red(&msg),
            dim(&format!("{attempts} attempt(s)")),
        ));
        self.advance();
    }

    fn on_stage_skipped(&self, stage: &str) {
        self.println(format!("  {} {:<24} {}", yellow("↷"), stage, dim("skipped")));
        self.advance();
    }

    fn on_run_complete(&self, report: &RunReport) {
        self.println(format!(
            "{} {}  {}  {}ms",
            status_mark(report.status),
            bold(&report.pipeline),
            report.status,
            report.duration_ms,
        ));
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }
}

fn status_mark(status: RunStatus) -> String {
    match status {
        RunStatus::Succeeded => green("✔"),
        RunStatus::Failed => red("✘"),
        RunStatus::Cancelled => yellow("⚠"),
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyse storage/uploads/report-2024.pdf
  docflow analyze report-2024

  # List registered pipelines and their stages
  docflow pipelines

  # Run one pipeline with an explicit input
  docflow run invoice-processing-pipeline --input '{"invoice_id":"inv-42"}'

  # Fire an event at every subscribed pipeline
  docflow emit document:process --input '{"document_id":"abc"}'

  # Serve NDJSON trigger events from stdin until EOF or Ctrl+C
  echo '{"event":"document:uploaded","data":{"document_id":"abc"}}' | docflow worker

  # Show the audit log
  docflow events --path workflow-events.jsonl

ENVIRONMENT VARIABLES:
  DOCFLOW_STORAGE_ROOT     Directory holding <document_id>.pdf uploads
  DOCFLOW_AUDIT_LOG        NDJSON audit log path
  DOCFLOW_MAX_RUNS         Concurrent runs per worker
  PDFIUM_LIB_PATH          Path to an existing libpdfium
  RUST_LOG                 Overrides the log filter
"#;

/// Run document-ingestion pipelines and analyse uploaded PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "docflow",
    version,
    about = "Run document-ingestion pipelines and analyse uploaded PDFs",
    long_about = "Run DAG document-ingestion pipelines (fan-out / fan-in stages with retries \
and failure cascades) and analyse uploaded PDFs to estimate processing cost and strategy.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding uploaded documents as `<document_id>.pdf`.
    #[arg(long, global = true, env = "DOCFLOW_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Path to libpdfium (file or directory).
    #[arg(long, global = true, env = "DOCFLOW_PDFIUM_LIB")]
    pdfium_lib: Option<PathBuf>,

    /// NDJSON audit log path.
    #[arg(long, global = true, env = "DOCFLOW_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    /// Do not write an audit log.
    #[arg(long, global = true, env = "DOCFLOW_NO_AUDIT")]
    no_audit: bool,

    /// Maximum number of runs executing at once.
    #[arg(long, global = true, env = "DOCFLOW_MAX_RUNS")]
    max_runs: Option<usize>,

    /// Maximum number of stages of one run executing at once.
    #[arg(long, global = true, env = "DOCFLOW_MAX_CONCURRENT_STAGES")]
    max_concurrent_stages: Option<usize>,

    /// Initial retry delay in milliseconds (doubles per attempt).
    #[arg(long, global = true, env = "DOCFLOW_RETRY_BACKOFF_MS")]
    retry_backoff_ms: Option<u64>,

    /// Simulated work per step in the demo pipelines, in milliseconds.
    #[arg(long, global = true, env = "DOCFLOW_STEP_LATENCY_MS")]
    step_latency_ms: Option<u64>,

    /// Print JSON instead of a human-readable summary.
    #[arg(long, global = true, env = "DOCFLOW_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCFLOW_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCFLOW_QUIET")]
    quiet: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "DOCFLOW_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyse one stored document: page count, text detection, cost.
    Analyze {
        /// Document id; resolved to `<storage-root>/<id>.pdf`.
        document_id: String,

        /// Informational original path of the upload.
        #[arg(long, default_value = "")]
        file_path: String,
    },

    /// List registered pipelines with their stages and parallel groups.
    Pipelines,

    /// Run one pipeline by name.
    Run {
        pipeline: String,

        /// Trigger input as a JSON document.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Run every pipeline subscribed to an event.
    Emit {
        event: String,

        /// Trigger input as a JSON document.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Serve NDJSON trigger events from stdin until EOF or Ctrl+C.
    Worker,

    /// Print the audit log.
    Events {
        /// Audit log to read. Defaults to the configured audit log.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-stage feedback, so library logs are
    // reduced to errors while it is shown.
    let show_progress = !cli.quiet && !cli.json && !cli.log_json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
    }

    let config = build_config(&cli)?;

    match &cli.command {
        Command::Analyze {
            document_id,
            file_path,
        } => analyze(&cli, &config, document_id, file_path).await,
        Command::Pipelines => list_pipelines(&cli, config),
        Command::Run { pipeline, input } => {
            let input = parse_input(input)?;
            let observer = CliRunObserver::new(show_progress);
            let worker = Worker::with_default_workflows(config)
                .context("Failed to start worker")?
                .with_observer(observer.clone());
            let report = worker
                .trigger(pipeline, input)
                .await
                .with_context(|| format!("Failed to run pipeline '{pipeline}'"))?;
            observer.finish();
            worker.shutdown();
            print_reports(&cli, &[report])
        }
        Command::Emit { event, input } => {
            let input = parse_input(input)?;
            let observer = CliRunObserver::new(show_progress);
            let worker = Worker::with_default_workflows(config)
                .context("Failed to start worker")?
                .with_observer(observer.clone());
            let results = worker.dispatch_event(event, input).await;
            observer.finish();
            worker.shutdown();
            if results.is_empty() && !cli.quiet {
                eprintln!("{} no pipeline subscribed to {}", yellow("⚠"), bold(event));
            }
            let (reports, rejected): (Vec<_>, Vec<_>) =
                results.into_iter().partition(|r| r.is_ok());
            let reports: Vec<RunReport> = reports.into_iter().filter_map(Result::ok).collect();
            print_reports(&cli, &reports)?;
            match rejected.into_iter().find_map(Result::err) {
                Some(e) => Err(e).with_context(|| format!("Failed to dispatch event '{event}'")),
                None => Ok(()),
            }
        }
        Command::Worker => serve(&cli, config, show_progress).await,
        Command::Events { path } => {
            let path = path
                .clone()
                .or_else(|| config.audit_log_path.clone())
                .context("No audit log configured")?;
            print_events(&cli, &path)
        }
    }
}

/// Map CLI args to `WorkerConfig`.
fn build_config(cli: &Cli) -> Result<WorkerConfig> {
    let mut builder = WorkerConfig::builder();
    if let Some(ref root) = cli.storage_root {
        builder = builder.storage_root(root);
    }
    if let Some(ref lib) = cli.pdfium_lib {
        builder = builder.pdfium_library_path(lib);
    }
    if cli.no_audit {
        builder = builder.audit_log_path(None);
    } else if let Some(ref path) = cli.audit_log {
        builder = builder.audit_log_path(Some(path.clone()));
    }
    if let Some(n) = cli.max_runs {
        builder = builder.max_runs(n);
    }
    if let Some(n) = cli.max_concurrent_stages {
        builder = builder.max_concurrent_stages(n);
    }
    if let Some(ms) = cli.retry_backoff_ms {
        builder = builder.retry_backoff_ms(ms);
    }
    if let Some(ms) = cli.step_latency_ms {
        builder = builder.step_latency_ms(ms);
    }
    builder.build().context("Invalid configuration")
}

fn parse_input(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--input is not valid JSON: {raw}"))
}

// ── Subcommands ──────────────────────────────────────────────────────────────

async fn analyze(cli: &Cli, config: &WorkerConfig, document_id: &str, file_path: &str) -> Result<()> {
    let analyzer = ContentAnalyzer::from_config(config);
    let report = analyzer
        .analyze(&DocumentInput::new(document_id, file_path))
        .await
        .with_context(|| format!("Failed to analyse document '{document_id}'"))?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise analysis")?
        );
        return Ok(());
    }

    let r = &report.result;
    let m = &report.metrics;
    println!("Document:       {}", r.document_id);
    println!("Pages:          {}", r.page_count);
    println!("File size:      {} bytes", r.file_size_bytes);
    println!(
        "Content:        {} ({} chars/page over {} pages)",
        if m.is_text_based { "text" } else { "image" },
        m.avg_chars_per_page,
        m.pages_sampled
    );
    println!("Process type:   {}", r.process_type);
    println!("Estimated cost: ${:.2}", r.estimated_cost);
    println!("Analysis time:  {}ms", m.analysis_time_ms);
    Ok(())
}

fn list_pipelines(cli: &Cli, mut config: WorkerConfig) -> Result<()> {
    // Listing never runs a stage, so no audit file is created for it.
    config.audit_log_path = None;
    let worker = Worker::with_default_workflows(config).context("Failed to start worker")?;

    if cli.json {
        let listing: Vec<Value> = worker
            .pipelines()
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name(),
                    "events": p.events(),
                    "stages": p.registrations(),
                    "parallel_groups": p.parallel_groups(),
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&listing).context("Failed to serialise pipelines")?
        );
        return Ok(());
    }

    for pipeline in worker.pipelines() {
        println!(
            "{} {}  {}",
            cyan("◆"),
            bold(pipeline.name()),
            dim(&format!("on {}", pipeline.events().join(", ")))
        );
        for reg in pipeline.registrations() {
            let parents = if reg.parents.is_empty() {
                "root".to_string()
            } else {
                format!("after {}", reg.parents.join(", "))
            };
            let mut line = format!("  {:<20} {}", reg.name, dim(&parents));
            if reg.retries > 0 {
                line.push_str(&dim(&format!("  retries {}", reg.retries)));
            }
            if let Some(group) = &reg.parallel_group {
                line.push_str(&format!("  {}", cyan(group)));
            }
            println!("{line}");
        }
    }
    Ok(())
}

async fn serve(cli: &Cli, config: WorkerConfig, show_progress: bool) -> Result<()> {
    let observer = CliRunObserver::new(show_progress);
    let worker = Arc::new(
        Worker::with_default_workflows(config)
            .context("Failed to start worker")?
            .with_observer(observer.clone()),
    );

    // Ctrl+C cancels in-flight runs and closes the event stream; the runs
    // already dispatched still settle before `serve` returns.
    let stop = Arc::new(Notify::new());
    let signal = tokio::spawn({
        let worker = worker.clone();
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                worker.shutdown();
                stop.notify_one();
            }
        }
    });

    let lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let events = LinesStream::new(lines)
        .take_until(stop.notified())
        .filter_map(|line| async move {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    return None;
                }
            };
            if line.trim().is_empty() {
                return None;
            }
            match serde_json::from_str::<TriggerEvent>(&line) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, line = %line, "Ignoring malformed trigger event");
                    None
                }
            }
        });

    let summary = worker.serve(events).await;
    worker.shutdown();
    signal.abort();
    observer.finish();

    let metrics = RunMetrics::from_reports(&observer.reports(), Utc::now());
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "summary": summary,
                "metrics": metrics,
            }))
            .context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        eprintln!(
            "{} {} events  {} runs  ({} succeeded, {} unsuccessful, {} rejected)",
            status_mark(if summary.unsuccessful == 0 && summary.rejected == 0 {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            }),
            bold(&summary.events.to_string()),
            summary.runs,
            summary.succeeded,
            summary.unsuccessful,
            summary.rejected,
        );
        print_metrics(&metrics);
    }
    Ok(())
}

fn print_events(cli: &Cli, path: &Path) -> Result<()> {
    let events =
        read_events(path).with_context(|| format!("Failed to read audit log {}", path.display()))?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&events).context("Failed to serialise events")?
        );
        return Ok(());
    }

    for event in &events {
        println!(
            "{}  {:<14} {:<20} {}",
            dim(&event.timestamp.to_rfc3339()),
            event.event_type.as_str(),
            event.step,
            dim(&event.data.to_string()),
        );
    }
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────────────

fn print_reports(cli: &Cli, reports: &[RunReport]) -> Result<()> {
    if cli.json {
        let json = if let [report] = reports {
            serde_json::to_string_pretty(report)
        } else {
            serde_json::to_string_pretty(reports)
        };
        println!("{}", json.context("Failed to serialise run report")?);
    } else if !cli.quiet {
        print_run_summaries(reports);
    }

    let unsuccessful = reports.iter().filter(|r| !r.is_success()).count();
    if unsuccessful > 0 {
        anyhow::bail!("{unsuccessful} run(s) did not succeed");
    }
    Ok(())
}

fn print_run_summaries(reports: &[RunReport]) {
    for report in reports {
        eprintln!(
            "{} {}  {}  {}ms  {}",
            status_mark(report.status),
            bold(&report.pipeline),
            report.status,
            report.duration_ms,
            dim(&report.run_id),
        );
        for stage in &report.stages {
            let mark = match stage.status {
                StageStatus::Succeeded => green("✓"),
                StageStatus::Failed => red("✗"),
                StageStatus::Skipped => yellow("↷"),
                StageStatus::Pending | StageStatus::Running => dim("·"),
            };
            let detail = match (&stage.error, stage.run_time_ms) {
                (Some(e), _) => red(&e.to_string()),
                (None, Some(ms)) => dim(&format!("{ms}ms")),
                (None, None) => dim(stage.status.as_str()),
            };
            eprintln!("  {} {:<24} {}", mark, stage.name, detail);
        }
    }

    if reports.len() > 1 {
        print_metrics(&RunMetrics::from_reports(reports, Utc::now()));
    }
}

fn print_metrics(metrics: &RunMetrics) {
    eprintln!(
        "   {} success rate  /  {} avg  /  {} in the last hour  —  {}",
        dim(&format!("{:.1}%", metrics.success_rate)),
        dim(&metrics.avg_duration),
        dim(&metrics.throughput_last_hour.to_string()),
        match metrics.health {
            Health::Healthy => green("healthy"),
            Health::Warning => yellow("warning"),
            Health::Critical => red("critical"),
        }
    );
}
