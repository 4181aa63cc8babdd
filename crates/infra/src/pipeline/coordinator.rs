//! Stage sequencing for a generation job.
//!
//! `text` (single call, fatal on failure) → `references` (fan-out over
//! discovered entities) → `illustrations` (fan-out over content units, judged).
//! Fan-out items that end without accepted content become warnings; they
//! never fail the job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, instrument};

use inkwell_ai::{
    ArtifactGenerator, ArtifactRequest, Evaluator, GenerationError, PriceTable, ReferenceContent,
    TextDraft, TextGenerator, TextRequest,
};
use inkwell_core::{Artifact, Stage, UsageRecord};

use crate::config::PipelineConfig;
use crate::jobs::JobError;
use crate::progress::ProgressReporter;
use crate::usage::UsageAccumulator;

use super::fanout::{self, FanOutItem, FanOutReport, QaSummary};
use super::regeneration::RegenerationLoop;

/// Payload of a `generation` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub brief: String,
    /// Overrides the configured unit count
    #[serde(default)]
    pub unit_count: Option<u32>,
}

/// The providers a pipeline runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub text: Arc<dyn TextGenerator>,
    pub references: Arc<dyn ArtifactGenerator>,
    /// References are accepted unjudged without one
    pub reference_judge: Option<Arc<dyn Evaluator>>,
    pub illustrations: Arc<dyn ArtifactGenerator>,
    pub illustration_judge: Arc<dyn Evaluator>,
}

/// Result of a completed generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub title: String,
    pub units: Vec<String>,
    pub references: Vec<Artifact>,
    pub illustrations: Vec<Artifact>,
    pub reference_summary: QaSummary,
    pub illustration_summary: QaSummary,
    pub warnings: Vec<String>,
    pub usage: UsageRecord,
    pub cost_usd: f64,
}

/// Pipeline failure that ends the job.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: GenerationError,
    },
}

impl From<PipelineError> for JobError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRequest(msg) => JobError::InvalidPayload(msg),
            PipelineError::Stage { stage, source } => JobError::Stage { stage, source },
        }
    }
}

pub struct GenerationPipeline {
    caps: Capabilities,
    config: PipelineConfig,
    prices: PriceTable,
}

impl GenerationPipeline {
    pub fn new(caps: Capabilities, config: PipelineConfig) -> Self {
        Self {
            caps,
            config,
            prices: PriceTable::default(),
        }
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Run all stages for one job.
    #[instrument(skip_all, fields(job_id = %reporter.job_id()))]
    pub async fn run(
        &self,
        request: &GenerationRequest,
        reporter: &mut ProgressReporter,
        usage: &UsageAccumulator,
    ) -> Result<GenerationOutput, PipelineError> {
        let unit_count = request.unit_count.unwrap_or(self.config.unit_count);
        if unit_count == 0 {
            return Err(PipelineError::InvalidRequest("unit_count must be > 0".to_string()));
        }
        if request.brief.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("brief is empty".to_string()));
        }

        let draft = self.text_stage(request, unit_count, reporter, usage).await?;
        let references = self.reference_stage(&draft, reporter, usage).await;
        let reference_content: Vec<ReferenceContent> = references
            .artifacts
            .iter()
            .filter_map(|a| {
                a.content_ref.as_ref().map(|content_ref| ReferenceContent {
                    key: a.key.clone(),
                    content_ref: content_ref.clone(),
                })
            })
            .collect();
        let illustrations = self
            .illustration_stage(&draft, reference_content, reporter, usage)
            .await;

        let snapshot = usage.snapshot();
        let cost_usd = self.prices.cost_of(&snapshot);
        info!(
            units = draft.units.len(),
            references = references.artifacts.len(),
            illustrations_passed = illustrations.summary.passed,
            artifact_count = snapshot.artifact_count,
            cost_usd,
            "generation pipeline finished"
        );

        Ok(GenerationOutput {
            title: draft.title,
            units: draft.units,
            references: references.artifacts,
            illustrations: illustrations.artifacts,
            reference_summary: references.summary,
            illustration_summary: illustrations.summary,
            warnings: reporter.warnings().to_vec(),
            usage: snapshot,
            cost_usd,
        })
    }

    async fn text_stage(
        &self,
        request: &GenerationRequest,
        unit_count: u32,
        reporter: &mut ProgressReporter,
        usage: &UsageAccumulator,
    ) -> Result<TextDraft, PipelineError> {
        reporter.update(Stage::Text, "writing text", None, None).await;

        let text_request = TextRequest {
            brief: request.brief.clone(),
            target_units: unit_count,
        };
        let started = Instant::now();
        let draft = self
            .caps
            .text
            .generate(&text_request)
            .await
            .map_err(|source| PipelineError::Stage {
                stage: Stage::Text,
                source,
            })?;

        match draft.usage.duration_ms {
            Some(_) => usage.record_call(&draft.usage),
            None => usage.record_llm_timed(
                draft.usage.input_units,
                draft.usage.output_units,
                &draft.usage.model,
                started.elapsed(),
            ),
        }

        if draft.units.is_empty() {
            return Err(PipelineError::Stage {
                stage: Stage::Text,
                source: GenerationError::malformed("text draft has no content units"),
            });
        }

        reporter.update(Stage::Text, "text ready", Some(1), Some(1)).await;
        Ok(draft)
    }

    async fn reference_stage(
        &self,
        draft: &TextDraft,
        reporter: &mut ProgressReporter,
        usage: &UsageAccumulator,
    ) -> FanOutReport {
        let total = draft.entities.len() as u32;
        reporter
            .update(Stage::References, "generating references", Some(0), Some(total))
            .await;

        let items = draft
            .entities
            .iter()
            .enumerate()
            .map(|(index, entity)| FanOutItem {
                index,
                key: entity.name.clone(),
                input: ArtifactRequest::new(entity.name.clone(), entity.description.clone()),
            })
            .collect();
        let regen = RegenerationLoop::new(
            self.caps.references.clone(),
            self.caps.reference_judge.clone(),
            usage.clone(),
            self.config.max_attempts,
        );

        let report = self
            .drive(Stage::References, "reference", items, regen, self.config.reference_concurrency, reporter)
            .await;

        for artifact in report.artifacts.iter().filter(|a| !a.has_content()) {
            reporter.add_warning(format!("reference '{}' has no content", artifact.key));
        }
        reporter.flush().await;
        report
    }

    async fn illustration_stage(
        &self,
        draft: &TextDraft,
        references: Vec<ReferenceContent>,
        reporter: &mut ProgressReporter,
        usage: &UsageAccumulator,
    ) -> FanOutReport {
        let total = draft.units.len() as u32;
        reporter
            .update(Stage::Illustrations, "illustrating", Some(0), Some(total))
            .await;

        let items = draft
            .units
            .iter()
            .enumerate()
            .map(|(index, unit)| FanOutItem {
                index,
                key: index.to_string(),
                input: ArtifactRequest::new(index.to_string(), unit.clone())
                    .with_references(references.clone()),
            })
            .collect();
        let regen = self.illustration_loop(usage);

        let report = self
            .drive(
                Stage::Illustrations,
                "illustration",
                items,
                regen,
                self.config.illustration_concurrency,
                reporter,
            )
            .await;

        for artifact in report.artifacts.iter().filter(|a| !a.accepted) {
            reporter.add_warning(format!(
                "illustration {} failed after {} attempts",
                artifact.index, artifact.attempt
            ));
        }
        reporter.flush().await;
        report
    }

    /// Re-run one illustration unit through the judged loop.
    pub async fn regenerate(&self, index: usize, request: ArtifactRequest, usage: &UsageAccumulator) -> Artifact {
        self.illustration_loop(usage).run(index, request).await
    }

    fn illustration_loop(&self, usage: &UsageAccumulator) -> RegenerationLoop {
        RegenerationLoop::new(
            self.caps.illustrations.clone(),
            Some(self.caps.illustration_judge.clone()),
            usage.clone(),
            self.config.max_attempts,
        )
    }

    async fn drive(
        &self,
        stage: Stage,
        noun: &str,
        items: Vec<FanOutItem<ArtifactRequest>>,
        regen: RegenerationLoop,
        concurrency: usize,
        reporter: &mut ProgressReporter,
    ) -> FanOutReport {
        let mut fanout = fanout::spawn(
            items,
            move |index, request| {
                let regen = regen.clone();
                async move { regen.run(index, request).await }
            },
            concurrency,
        );

        while let Some(tick) = fanout.next().await {
            reporter
                .update(
                    stage,
                    format!("{noun} {}/{}", tick.completed, tick.total),
                    Some(tick.completed as u32),
                    Some(tick.total as u32),
                )
                .await;
        }
        fanout.finish().await
    }
}
