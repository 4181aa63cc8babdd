//! Job handlers wiring the generation pipeline into the worker runtime.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use inkwell_ai::{ArtifactRequest, ReferenceContent};
use inkwell_core::{Artifact, Stage};

use crate::jobs::{JobContext, JobError, JobHandler, JobOutput};
use crate::progress::ProgressReporter;
use crate::usage::UsageAccumulator;

use super::coordinator::{GenerationPipeline, GenerationRequest};

fn parse<T: for<'de> Deserialize<'de>>(payload: serde_json::Value) -> Result<T, JobError> {
    serde_json::from_value(payload).map_err(|e| JobError::InvalidPayload(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, JobError> {
    serde_json::to_value(value).map_err(|e| JobError::Internal(format!("failed to encode output: {e}")))
}

/// Handles `generation` jobs.
pub struct GenerationHandler {
    pipeline: Arc<GenerationPipeline>,
}

impl GenerationHandler {
    pub fn new(pipeline: Arc<GenerationPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for GenerationHandler {
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<JobOutput, JobError> {
        let request: GenerationRequest = parse(payload)?;
        let mut reporter = ProgressReporter::new(
            ctx.job_id,
            ctx.store.clone(),
            self.pipeline.config().progress_interval,
        )
        .with_latest(ctx.progress.clone());
        let usage = UsageAccumulator::start();

        let output = match self.pipeline.run(&request, &mut reporter, &usage).await {
            Ok(output) => output,
            Err(e) => {
                reporter.finish(Stage::Failed, e.to_string()).await;
                return Err(e.into());
            }
        };
        reporter.finish(Stage::Complete, "done").await;

        info!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            warnings = output.warnings.len(),
            "generation finished"
        );
        let result = to_value(&output)?;
        Ok(JobOutput::new(result).with_usage(output.usage, output.cost_usd))
    }
}

/// Payload of a `regeneration` job: re-run one illustration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenerationRequest {
    pub unit_index: usize,
    pub prompt: String,
    #[serde(default)]
    pub references: Vec<ReferenceContent>,
}

/// Handles `regeneration` jobs.
pub struct RegenerationHandler {
    pipeline: Arc<GenerationPipeline>,
}

impl RegenerationHandler {
    pub fn new(pipeline: Arc<GenerationPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for RegenerationHandler {
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<JobOutput, JobError> {
        let request: RegenerationRequest = parse(payload)?;
        let mut reporter = ProgressReporter::new(
            ctx.job_id,
            ctx.store.clone(),
            self.pipeline.config().progress_interval,
        )
        .with_latest(ctx.progress.clone());
        let usage = UsageAccumulator::start();

        reporter
            .update(Stage::Illustrations, "regenerating illustration", Some(0), Some(1))
            .await;
        let artifact_request = ArtifactRequest::new(request.unit_index.to_string(), request.prompt)
            .with_references(request.references);
        let artifact: Artifact = self
            .pipeline
            .regenerate(request.unit_index, artifact_request, &usage)
            .await;
        reporter
            .update(Stage::Illustrations, "regenerating illustration", Some(1), Some(1))
            .await;

        if !artifact.has_content() {
            let cause = artifact.error.as_deref().unwrap_or("no content generated");
            let message = format!("illustration {} produced no content: {cause}", artifact.index);
            reporter.finish(Stage::Failed, message.clone()).await;
            return Err(JobError::Artifact(message));
        }
        if !artifact.accepted {
            reporter.add_warning(format!(
                "illustration {} failed after {} attempts",
                artifact.index, artifact.attempt
            ));
        }
        reporter.finish(Stage::Complete, "done").await;

        let snapshot = usage.snapshot();
        let cost_usd = self.pipeline.prices().cost_of(&snapshot);
        let result = to_value(&artifact)?;
        Ok(JobOutput::new(result).with_usage(snapshot, cost_usd))
    }
}
