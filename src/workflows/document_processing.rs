//! `document-processing-pipeline`: the full ingestion DAG with two fan-out /
//! fan-in stages.
//!
//! ```text
//!                          ┌─ parse-text ───┐             ┌─ store-database ─┐
//! upload ─▶ validate ─▶ extract ─ parse-images ─▶ transform ─ store-s3 ───────▶ notify ─▶ cleanup
//!                          └─ parse-tables ─┘             └─ index-search ───┘
//! ```
//!
//! Stage bodies are simulated: they sleep for the configured latency and
//! return fixed, typed results. Downstream stages read their parents' outputs
//! through [`StepContext::parent_output`].

use crate::analyzer::DocumentInput;
use crate::error::StepError;
use crate::pipeline::{step_fn, PipelineDefinition, StageDefinition, StepContext};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

pub const PIPELINE: &str = "document-processing-pipeline";
pub const EVENT: &str = "document:process";

const COMPLETED: &str = "completed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutput {
    pub status: String,
    pub document_id: String,
    pub file_size: u64,
    pub uploaded_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateOutput {
    pub status: String,
    pub valid: bool,
    pub file_type: String,
    pub page_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractOutput {
    pub status: String,
    pub text_extracted: bool,
    pub image_count: usize,
    pub table_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOutput {
    pub status: String,
    pub normalized: bool,
    pub enriched: bool,
    pub records_created: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOutput {
    pub status: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default)]
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyOutput {
    pub status: String,
    pub notified: Vec<String>,
    pub notifications_sent: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutput {
    pub status: String,
    pub temp_files_removed: usize,
    pub cache_cleared: bool,
}

const PARSE_STAGES: [&str; 3] = ["parse-text", "parse-images", "parse-tables"];
const STORE_STAGES: [&str; 3] = ["store-database", "store-s3", "index-search"];

pub fn definition(latency: Duration) -> PipelineDefinition {
    PipelineDefinition::new(PIPELINE)
        .on_event(EVENT)
        .stage(StageDefinition::new(
            "upload",
            step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                started(&ctx, &input, latency).await;
                Ok::<_, StepError>(UploadOutput {
                    status: COMPLETED.into(),
                    document_id: input.document_id,
                    file_size: 2_457_600,
                    uploaded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                })
            }),
        ))
        .stage(
            StageDefinition::new(
                "validate",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    let upload: UploadOutput = ctx.parent_output("upload")?;
                    if upload.document_id != input.document_id {
                        return Err(StepError::failed(format!(
                            "uploaded document '{}' does not match '{}'",
                            upload.document_id, input.document_id
                        )));
                    }
                    Ok(ValidateOutput {
                        status: COMPLETED.into(),
                        valid: true,
                        file_type: "application/pdf".into(),
                        page_count: 47,
                    })
                }),
            )
            .after(["upload"]),
        )
        .stage(
            StageDefinition::new(
                "extract",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(ExtractOutput {
                        status: COMPLETED.into(),
                        text_extracted: true,
                        image_count: 12,
                        table_count: 8,
                    })
                }),
            )
            .after(["validate"]),
        )
        .stage(
            StageDefinition::new(
                "parse-text",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(ParseOutput {
                        status: COMPLETED.into(),
                        word_count: Some(15_234),
                        language: Some("en".into()),
                        entities: ["Acme Corporation", "John Smith", "New York", "Q4 2024"]
                            .map(String::from)
                            .to_vec(),
                        ..Default::default()
                    })
                }),
            )
            .after(["extract"]),
        )
        .stage(
            StageDefinition::new(
                "parse-images",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(ParseOutput {
                        status: COMPLETED.into(),
                        images: ["chart_revenue.png", "logo.png", "diagram_architecture.png"]
                            .map(String::from)
                            .to_vec(),
                        ..Default::default()
                    })
                }),
            )
            .after(["extract"]),
        )
        .stage(
            StageDefinition::new(
                "parse-tables",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(ParseOutput {
                        status: COMPLETED.into(),
                        tables: vec![
                            json!({"name": "Revenue Summary", "rows": 24, "columns": 6}),
                            json!({"name": "Employee Data", "rows": 156, "columns": 8}),
                        ],
                        ..Default::default()
                    })
                }),
            )
            .after(["extract"]),
        )
        .stage(
            StageDefinition::new(
                "transform",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    for parent in PARSE_STAGES {
                        let parsed: ParseOutput = ctx.parent_output(parent)?;
                        if parsed.status != COMPLETED {
                            return Err(StepError::failed(format!("{} did not complete", parent)));
                        }
                    }
                    Ok(TransformOutput {
                        status: COMPLETED.into(),
                        normalized: true,
                        enriched: true,
                        records_created: 342,
                    })
                }),
            )
            .after(PARSE_STAGES),
        )
        .stage(
            StageDefinition::new(
                "store-database",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(StorageOutput {
                        status: COMPLETED.into(),
                        location: "postgresql://documents/".into(),
                        record_id: Some(format!("doc_{}", input.document_id)),
                        indexed: false,
                    })
                }),
            )
            .after(["transform"]),
        )
        .stage(
            StageDefinition::new(
                "store-s3",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(StorageOutput {
                        status: COMPLETED.into(),
                        location: format!("s3://documents-bucket/{}.pdf", input.document_id),
                        record_id: None,
                        indexed: false,
                    })
                }),
            )
            .after(["transform"]),
        )
        .stage(
            StageDefinition::new(
                "index-search",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(StorageOutput {
                        status: COMPLETED.into(),
                        location: "elasticsearch://documents/".into(),
                        record_id: None,
                        indexed: true,
                    })
                }),
            )
            .after(["transform"]),
        )
        .stage(
            StageDefinition::new(
                "notify",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    for parent in STORE_STAGES {
                        let stored: StorageOutput = ctx.parent_output(parent)?;
                        info!(stage = parent, location = %stored.location, "Stored");
                    }
                    let notified = vec!["user@example.com".to_string(), "admin@example.com".into()];
                    Ok::<_, StepError>(NotifyOutput {
                        status: COMPLETED.into(),
                        notifications_sent: notified.len(),
                        notified,
                    })
                }),
            )
            .after(STORE_STAGES),
        )
        .stage(
            StageDefinition::new(
                "cleanup",
                step_fn(move |ctx: StepContext, input: DocumentInput| async move {
                    started(&ctx, &input, latency).await;
                    Ok::<_, StepError>(CleanupOutput {
                        status: COMPLETED.into(),
                        temp_files_removed: 15,
                        cache_cleared: true,
                    })
                }),
            )
            .after(["notify"]),
        )
}

async fn started(ctx: &StepContext, input: &DocumentInput, latency: Duration) {
    info!(
        stage = %ctx.stage,
        document_id = %input.document_id,
        "Document processing stage started"
    );
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}
