//! Generate, judge, and regenerate with feedback.

use std::sync::Arc;

use tracing::{debug, warn};

use inkwell_ai::{ArtifactGenerator, ArtifactRequest, Evaluator, augment_request};
use inkwell_core::{Artifact, Verdict};

use crate::usage::UsageAccumulator;

/// One artifact's regeneration loop.
///
/// Each attempt generates, then (if a judge is configured) evaluates. A
/// failing verdict with attempts left builds an augmented request from the
/// original plus the verdict's issues. A raised generator or judge error
/// consumes the attempt. The loop always returns an `Artifact`; it never
/// fails.
#[derive(Clone)]
pub struct RegenerationLoop {
    generator: Arc<dyn ArtifactGenerator>,
    evaluator: Option<Arc<dyn Evaluator>>,
    usage: UsageAccumulator,
    max_attempts: u32,
}

impl RegenerationLoop {
    pub fn new(
        generator: Arc<dyn ArtifactGenerator>,
        evaluator: Option<Arc<dyn Evaluator>>,
        usage: UsageAccumulator,
        max_attempts: u32,
    ) -> Self {
        Self {
            generator,
            evaluator,
            usage,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn run(&self, index: usize, original: ArtifactRequest) -> Artifact {
        let mut artifact = Artifact::new(index, original.key.clone(), self.max_attempts);
        let mut request = original.clone();

        for attempt in 1..=self.max_attempts {
            artifact.attempt = attempt;

            let content = match self.generator.generate(&request).await {
                Ok(content) => content,
                Err(e) => {
                    debug!(key = %original.key, attempt, error = %e, "generation failed");
                    artifact.error = Some(e.to_string());
                    continue;
                }
            };

            self.usage.record_artifact(&content.model, attempt > 1);
            artifact.content_ref = Some(content.content_ref.clone());
            artifact.verdict = Verdict::Pending;
            artifact.issues.clear();
            artifact.error = None;

            let Some(evaluator) = &self.evaluator else {
                artifact.accepted = true;
                return artifact;
            };

            let evaluation = match evaluator.evaluate(&content, &original).await {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    debug!(key = %original.key, attempt, error = %e, "evaluation failed");
                    artifact.error = Some(e.to_string());
                    continue;
                }
            };
            if let Some(call) = &evaluation.usage {
                self.usage.record_call(call);
            }

            artifact.verdict = evaluation.verdict;
            if evaluation.passed() {
                debug!(key = %original.key, attempt, "artifact accepted");
                artifact.accepted = true;
                return artifact;
            }

            debug!(
                key = %original.key,
                attempt,
                issues = evaluation.issues.len(),
                "artifact failed evaluation"
            );
            request = augment_request(&original, &evaluation.issues);
            artifact.issues = evaluation.issues;
        }

        warn!(
            key = %artifact.key,
            attempts = artifact.attempt,
            has_content = artifact.has_content(),
            error = artifact.error.as_deref().unwrap_or(""),
            "artifact exhausted its attempts"
        );
        artifact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedArtifacts, ScriptedJudge};
    use inkwell_ai::{CallUsage, Evaluation, GenerationError};
    use inkwell_core::{Issue, IssueCategory};

    fn text_issue() -> Vec<Issue> {
        vec![Issue::new(IssueCategory::Text, "lettering on the sign")]
    }

    #[tokio::test]
    async fn passes_on_first_attempt() {
        let generator = Arc::new(ScriptedArtifacts::new());
        let judge = Arc::new(ScriptedJudge::new());
        let usage = UsageAccumulator::start();
        let regen = RegenerationLoop::new(generator, Some(judge), usage.clone(), 3);

        let artifact = regen.run(0, ArtifactRequest::new("0", "a fox")).await;
        assert!(artifact.accepted);
        assert_eq!(artifact.verdict, Verdict::Pass);
        assert_eq!(artifact.attempt, 1);
        assert_eq!(artifact.content_ref.as_deref(), Some("0#1"));
        assert_eq!(usage.snapshot().artifact_retries, 0);
    }

    #[tokio::test]
    async fn augmented_retry_uses_original_plus_latest_issues() {
        let generator = Arc::new(ScriptedArtifacts::new());
        let judge = Arc::new(ScriptedJudge::new().script(
            "0",
            vec![
                Ok(Evaluation::fail(text_issue())),
                Ok(Evaluation::fail(vec![Issue::new(IssueCategory::Style, "too dark")])),
                Ok(Evaluation::pass()),
            ],
        ));
        let regen = RegenerationLoop::new(generator.clone(), Some(judge.clone()), UsageAccumulator::start(), 3);

        let artifact = regen.run(0, ArtifactRequest::new("0", "a fox")).await;
        assert!(artifact.accepted);
        assert_eq!(artifact.attempt, 3);

        let calls = generator.calls();
        assert!(!calls[0].is_augmented());
        assert_eq!(calls[1].avoid.len(), 1);
        assert_eq!(calls[1].avoid[0].category, IssueCategory::Text);
        // feedback replaces, it does not stack
        assert_eq!(calls[2].avoid.len(), 1);
        assert_eq!(calls[2].avoid[0].category, IssueCategory::Style);

        // the judge always sees the original request
        assert!(judge.judged().iter().all(|(_, criteria)| !criteria.is_augmented()));
    }

    #[tokio::test]
    async fn exhaustion_keeps_last_content_and_failing_verdict() {
        let generator = Arc::new(ScriptedArtifacts::new());
        let judge = Arc::new(ScriptedJudge::new().always_fail("7", text_issue()));
        let usage = UsageAccumulator::start();
        let regen = RegenerationLoop::new(generator.clone(), Some(judge), usage.clone(), 3);

        let artifact = regen.run(7, ArtifactRequest::new("7", "a boat")).await;
        assert!(!artifact.accepted);
        assert_eq!(artifact.verdict, Verdict::Fail);
        assert_eq!(artifact.attempt, 3);
        assert_eq!(artifact.content_ref.as_deref(), Some("7#3"));
        assert_eq!(artifact.issues, text_issue());
        assert_eq!(generator.calls().len(), 3);
        assert_eq!(usage.snapshot().artifact_count, 3);
    }

    #[tokio::test]
    async fn generator_error_consumes_attempt_without_judging() {
        let generator = Arc::new(ScriptedArtifacts::new().script(
            "0",
            vec![Err(GenerationError::transient("503")), Ok(())],
        ));
        let judge = Arc::new(ScriptedJudge::new());
        let usage = UsageAccumulator::start();
        let regen = RegenerationLoop::new(generator, Some(judge.clone()), usage.clone(), 3);

        let artifact = regen.run(0, ArtifactRequest::new("0", "a fox")).await;
        assert!(artifact.accepted);
        assert_eq!(artifact.attempt, 2);
        assert!(artifact.error.is_none());
        assert_eq!(judge.judged().len(), 1);
        // only successful generations are recorded
        let snapshot = usage.snapshot();
        assert_eq!(snapshot.artifact_count, 1);
        assert_eq!(snapshot.artifact_retries, 1);
    }

    #[tokio::test]
    async fn raised_error_on_last_attempt_is_the_terminal_cause() {
        let generator = Arc::new(ScriptedArtifacts::new().script(
            "0",
            vec![Ok(()), Err(GenerationError::transient("503"))],
        ));
        let judge = Arc::new(ScriptedJudge::new().always_fail("0", text_issue()));
        let regen = RegenerationLoop::new(generator, Some(judge), UsageAccumulator::start(), 2);

        let artifact = regen.run(0, ArtifactRequest::new("0", "a fox")).await;
        assert!(!artifact.accepted);
        assert_eq!(artifact.attempt, 2);
        assert_eq!(artifact.content_ref.as_deref(), Some("0#1"));
        assert_eq!(artifact.verdict, Verdict::Fail);
        assert_eq!(artifact.error.as_deref(), Some("provider unavailable: 503"));
    }

    #[tokio::test]
    async fn judge_error_keeps_content_unjudged() {
        let generator = Arc::new(ScriptedArtifacts::new());
        let judge = Arc::new(ScriptedJudge::new().script(
            "0",
            vec![Err(GenerationError::transient("judge down"))],
        ));
        let regen = RegenerationLoop::new(generator, Some(judge), UsageAccumulator::start(), 1);

        let artifact = regen.run(0, ArtifactRequest::new("0", "a fox")).await;
        assert!(!artifact.accepted);
        assert_eq!(artifact.verdict, Verdict::Pending);
        assert_eq!(artifact.content_ref.as_deref(), Some("0#1"));
        assert!(artifact.error.is_some());
    }

    #[tokio::test]
    async fn without_judge_first_content_is_accepted() {
        let generator = Arc::new(ScriptedArtifacts::new());
        let regen = RegenerationLoop::new(generator, None, UsageAccumulator::start(), 3);

        let artifact = regen.run(2, ArtifactRequest::new("fox", "a fox")).await;
        assert!(artifact.accepted);
        assert_eq!(artifact.verdict, Verdict::Pending);
        assert_eq!(artifact.index, 2);
    }

    #[tokio::test]
    async fn judge_usage_is_recorded() {
        let generator = Arc::new(ScriptedArtifacts::new());
        let judge = Arc::new(ScriptedJudge::new().script(
            "0",
            vec![Ok(Evaluation::pass().with_usage(CallUsage {
                input_units: 300,
                output_units: 20,
                model: "judge".to_string(),
                duration_ms: Some(400),
            }))],
        ));
        let usage = UsageAccumulator::start();
        let regen = RegenerationLoop::new(generator, Some(judge), usage.clone(), 3);

        regen.run(0, ArtifactRequest::new("0", "a fox")).await;
        let snapshot = usage.snapshot();
        assert_eq!(snapshot.call_count, 1);
        assert_eq!(snapshot.input_units, 300);
        assert_eq!(snapshot.llm_durations_ms, vec![400]);
    }

    #[tokio::test]
    async fn zero_max_attempts_still_runs_once() {
        let generator = Arc::new(ScriptedArtifacts::new());
        let regen = RegenerationLoop::new(generator.clone(), None, UsageAccumulator::start(), 0);
        assert_eq!(regen.max_attempts(), 1);
        regen.run(0, ArtifactRequest::new("0", "a fox")).await;
        assert_eq!(generator.calls().len(), 1);
    }
}
