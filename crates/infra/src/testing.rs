//! Scripted generator and evaluator fakes shared by the crate's tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use inkwell_ai::{
    ArtifactGenerator, ArtifactRequest, CallUsage, EntityRef, Evaluation, Evaluator,
    GeneratedContent, GenerationError, TextDraft, TextGenerator, TextRequest,
};
use inkwell_core::Issue;

pub const ARTIFACT_MODEL: &str = "image-test";
pub const TEXT_MODEL: &str = "text-test";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Text generator returning a fixed draft (or error).
pub struct ScriptedText {
    result: Result<TextDraft, GenerationError>,
}

impl ScriptedText {
    pub fn units(count: usize, entities: &[&str]) -> Self {
        let units = (1..=count).map(|i| format!("unit {i}")).collect();
        let entities = entities
            .iter()
            .map(|name| EntityRef {
                name: name.to_string(),
                description: format!("a drawing of {name}"),
            })
            .collect();
        Self {
            result: Ok(TextDraft {
                title: "Test Story".to_string(),
                units,
                entities,
                usage: CallUsage {
                    input_units: 1000,
                    output_units: 500,
                    model: TEXT_MODEL.to_string(),
                    duration_ms: Some(1200),
                },
            }),
        }
    }

    pub fn failing(error: GenerationError) -> Self {
        Self { result: Err(error) }
    }
}

#[async_trait]
impl TextGenerator for ScriptedText {
    async fn generate(&self, _request: &TextRequest) -> Result<TextDraft, GenerationError> {
        self.result.clone()
    }
}

/// Artifact generator with per-key scripts.
///
/// Unscripted calls succeed with content `"{key}#{n}"`, `n` being the
/// 1-indexed call number for that key.
#[derive(Default)]
pub struct ScriptedArtifacts {
    scripts: Mutex<HashMap<String, VecDeque<Result<(), GenerationError>>>>,
    panics: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ArtifactRequest>>,
}

impl ScriptedArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for `key`; `Ok(())` produces content as usual.
    pub fn script(self, key: &str, outcomes: Vec<Result<(), GenerationError>>) -> Self {
        lock(&self.scripts).insert(key.to_string(), outcomes.into());
        self
    }

    pub fn panic_on(mut self, key: &str) -> Self {
        self.panics.insert(key.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<ArtifactRequest> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, key: &str) -> Vec<ArtifactRequest> {
        self.calls().into_iter().filter(|r| r.key == key).collect()
    }
}

#[async_trait]
impl ArtifactGenerator for ScriptedArtifacts {
    async fn generate(&self, request: &ArtifactRequest) -> Result<GeneratedContent, GenerationError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panics.contains(&request.key) {
            panic!("generator crashed on {}", request.key);
        }

        let n = {
            let mut calls = lock(&self.calls);
            calls.push(request.clone());
            calls.iter().filter(|r| r.key == request.key).count()
        };
        let scripted = lock(&self.scripts)
            .get_mut(&request.key)
            .and_then(|outcomes| outcomes.pop_front());
        scripted.unwrap_or(Ok(()))?;

        Ok(GeneratedContent {
            content_ref: format!("{}#{}", request.key, n),
            model: ARTIFACT_MODEL.to_string(),
        })
    }
}

/// Evaluator with per-key verdict scripts; unscripted content passes.
#[derive(Default)]
pub struct ScriptedJudge {
    scripts: Mutex<HashMap<String, VecDeque<Result<Evaluation, GenerationError>>>>,
    always_fail: HashMap<String, Vec<Issue>>,
    judged: Mutex<Vec<(String, ArtifactRequest)>>,
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, key: &str, verdicts: Vec<Result<Evaluation, GenerationError>>) -> Self {
        lock(&self.scripts).insert(key.to_string(), verdicts.into());
        self
    }

    pub fn always_fail(mut self, key: &str, issues: Vec<Issue>) -> Self {
        self.always_fail.insert(key.to_string(), issues);
        self
    }

    /// `(content_ref, criteria)` for every evaluation, in call order.
    pub fn judged(&self) -> Vec<(String, ArtifactRequest)> {
        lock(&self.judged).clone()
    }
}

#[async_trait]
impl Evaluator for ScriptedJudge {
    async fn evaluate(
        &self,
        content: &GeneratedContent,
        criteria: &ArtifactRequest,
    ) -> Result<Evaluation, GenerationError> {
        lock(&self.judged).push((content.content_ref.clone(), criteria.clone()));

        if let Some(issues) = self.always_fail.get(&criteria.key) {
            return Ok(Evaluation::fail(issues.clone()));
        }
        let scripted = lock(&self.scripts)
            .get_mut(&criteria.key)
            .and_then(|verdicts| verdicts.pop_front());
        scripted.unwrap_or_else(|| Ok(Evaluation::pass()))
    }
}
