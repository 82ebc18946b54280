//! `invoice-processing-pipeline`: a seven-step chain whose storage step
//! always fails, so the final notification is skipped.
//!
//! Useful for exercising failure reporting end to end.

use crate::error::StepError;
use crate::pipeline::{step_fn, PipelineDefinition, StageDefinition, StepContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

pub const PIPELINE: &str = "invoice-processing-pipeline";
pub const EVENT: &str = "invoice:process";

pub const STORE_FAILURE: &str = "database connection timeout after 30s";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceInput {
    pub invoice_id: String,
    #[serde(default)]
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub status: String,
    pub message: String,
}

/// `(stage, message)` in chain order. `None` marks the failing step.
const STEPS: [(&str, Option<&str>); 7] = [
    ("step-1-receive", Some("Invoice successfully received")),
    ("step-2-validate", Some("Invoice validation passed")),
    ("step-3-extract", Some("Data extracted successfully")),
    ("step-4-calculate", Some("Calculations completed")),
    ("step-5-verify", Some("Verification complete")),
    ("step-6-store", None),
    ("step-7-notify", Some("Notification sent")),
];

pub fn definition(latency: Duration) -> PipelineDefinition {
    let mut def = PipelineDefinition::new(PIPELINE).on_event(EVENT);
    let mut previous: Option<&str> = None;

    for (name, message) in STEPS {
        let h = step_fn(move |ctx: StepContext, input: InvoiceInput| async move {
            info!(stage = %ctx.stage, invoice_id = %input.invoice_id, "Invoice step started");
            tokio::time::sleep(latency).await;
            match message {
                Some(message) => Ok(StepOutput {
                    status: "completed".into(),
                    message: message.into(),
                }),
                None => {
                    warn!(stage = %ctx.stage, "Database connection timeout");
                    Err(StepError::failed(STORE_FAILURE))
                }
            }
        });
        let stage = StageDefinition::new(name, h).after(previous);
        def = def.stage(stage);
        previous = Some(name);
    }
    def
}
