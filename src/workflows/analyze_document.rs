//! `analyze-document`: run the Content Analyzer when a document is uploaded.

use crate::analyzer::{AnalysisResult, ContentAnalyzer, DocumentInput};
use crate::error::StepError;
use crate::pipeline::{handler, PipelineDefinition, StageDefinition, Step, StepContext};
use async_trait::async_trait;
use tracing::{error, info};

pub const PIPELINE: &str = "analyze-document";
pub const EVENT: &str = "document:uploaded";
pub const STAGE: &str = "analyze";
/// Extra attempts after a failed analysis.
pub const RETRIES: u32 = 3;

/// Stage wrapping [`ContentAnalyzer::analyze`].
#[derive(Debug, Clone)]
pub struct AnalyzeStep {
    analyzer: ContentAnalyzer,
}

impl AnalyzeStep {
    pub fn new(analyzer: ContentAnalyzer) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl Step for AnalyzeStep {
    type Input = DocumentInput;
    type Output = AnalysisResult;

    async fn run(&self, ctx: StepContext, input: DocumentInput) -> Result<AnalysisResult, StepError> {
        info!(
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            document_id = %input.document_id,
            "Document analysis: processing"
        );

        let report = self.analyzer.analyze(&input).await.map_err(|e| {
            error!(document_id = %input.document_id, error = %e, "Document analysis failed");
            StepError::from(e)
        })?;

        info!(
            run_id = %ctx.run_id,
            document_id = %report.result.document_id,
            process_type = %report.result.process_type,
            page_count = report.result.page_count,
            "Document analysis: completed"
        );
        Ok(report.result)
    }
}

pub fn definition(analyzer: ContentAnalyzer) -> PipelineDefinition {
    PipelineDefinition::new(PIPELINE)
        .on_event(EVENT)
        .stage(StageDefinition::new(STAGE, handler(AnalyzeStep::new(analyzer))).retries(RETRIES))
}
