//! Capability traits and the data exchanged with them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use inkwell_core::{Issue, IssueCategory, Verdict};

use crate::error::GenerationError;

/// Token/unit accounting reported by a single provider call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUsage {
    pub input_units: u64,
    pub output_units: u64,
    pub model: String,
    pub duration_ms: Option<u64>,
}

/// Brief for the single-shot text stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRequest {
    pub brief: String,
    /// Number of content units the draft should be split into
    pub target_units: u32,
}

/// An entity discovered in the draft that needs a reference artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub name: String,
    pub description: String,
}

/// Output of the text stage: already structured by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDraft {
    pub title: String,
    /// One entry per content unit, in canonical order
    pub units: Vec<String>,
    pub entities: Vec<EntityRef>,
    pub usage: CallUsage,
}

/// A reference artifact handed to later requests for consistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceContent {
    pub key: String,
    pub content_ref: String,
}

/// Per-category instructions derived from a failed verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avoidance {
    pub category: IssueCategory,
    pub details: Vec<String>,
}

/// Input to one artifact generation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRequest {
    pub key: String,
    pub prompt: String,
    #[serde(default)]
    pub references: Vec<ReferenceContent>,
    /// Empty on the first attempt
    #[serde(default)]
    pub avoid: Vec<Avoidance>,
}

impl ArtifactRequest {
    pub fn new(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prompt: prompt.into(),
            references: Vec::new(),
            avoid: Vec::new(),
        }
    }

    pub fn with_references(mut self, references: Vec<ReferenceContent>) -> Self {
        self.references = references;
        self
    }

    pub fn is_augmented(&self) -> bool {
        !self.avoid.is_empty()
    }
}

/// Content produced by an artifact generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub content_ref: String,
    pub model: String,
}

/// Evaluator answer for one piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    /// `Pass` or `Fail`
    pub verdict: Verdict,
    pub issues: Vec<Issue>,
    pub usage: Option<CallUsage>,
}

impl Evaluation {
    pub fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            issues: Vec::new(),
            usage: None,
        }
    }

    pub fn fail(issues: Vec<Issue>) -> Self {
        Self {
            verdict: Verdict::Fail,
            issues,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: CallUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Single-shot text generation.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &TextRequest) -> Result<TextDraft, GenerationError>;
}

/// Generates one artifact (reference or illustration).
#[async_trait]
pub trait ArtifactGenerator: Send + Sync {
    async fn generate(&self, request: &ArtifactRequest) -> Result<GeneratedContent, GenerationError>;
}

/// Quality judge.
///
/// `criteria` is the original, un-augmented request the content must satisfy.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        content: &GeneratedContent,
        criteria: &ArtifactRequest,
    ) -> Result<Evaluation, GenerationError>;
}
