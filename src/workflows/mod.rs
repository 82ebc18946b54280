//! Reference pipelines registered by a default worker.
//!
//! | Pipeline | Event | Shape |
//! |----------|-------|-------|
//! | [`analyze_document`] | `document:uploaded` | single `analyze` stage, 3 retries |
//! | [`document_processing`] | `document:process` | 11 stages, two fan-out / fan-in groups |
//! | [`invoice`] | `invoice:process` | 7-step chain, step 6 always fails |

pub mod analyze_document;
pub mod document_processing;
pub mod invoice;

use crate::analyzer::ContentAnalyzer;
use crate::config::WorkerConfig;
use crate::pipeline::PipelineDefinition;

/// All reference pipelines, configured from `config`.
pub fn default_workflows(config: &WorkerConfig) -> Vec<PipelineDefinition> {
    vec![
        analyze_document::definition(ContentAnalyzer::from_config(config)),
        document_processing::definition(config.step_latency()),
        invoice::definition(config.step_latency()),
    ]
}
