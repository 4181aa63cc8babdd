//! Per-unit outcome of a fan-out stage.

use serde::{Deserialize, Serialize};

/// Quality verdict for one generated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Not judged (no evaluator, or the judge itself errored)
    Pending,
    Pass,
    Fail,
}

/// Category of a quality issue; each maps to one avoidance instruction on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// Unwanted rendered text or lettering
    Text,
    /// Entity inconsistent with its reference
    Character,
    Composition,
    Style,
    Other,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::Text => "text",
            IssueCategory::Character => "character",
            IssueCategory::Composition => "composition",
            IssueCategory::Style => "style",
            IssueCategory::Other => "other",
        }
    }
}

impl core::fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured finding from the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    pub category: IssueCategory,
    pub detail: String,
}

impl Issue {
    pub fn new(category: IssueCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }
}

/// Terminal state of one regeneration loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Canonical position within its stage
    pub index: usize,
    /// Identity used to merge fan-out results (entity name or unit number)
    pub key: String,
    /// Last generated content; kept even when the verdict failed
    pub content_ref: Option<String>,
    pub verdict: Verdict,
    /// Attempts consumed
    pub attempt: u32,
    pub max_attempts: u32,
    /// Issues of the final verdict
    pub issues: Vec<Issue>,
    /// Transport error that ended the loop, if the last attempt raised
    pub error: Option<String>,
    /// True when the loop ended `accepted` rather than `exhausted`
    pub accepted: bool,
}

impl Artifact {
    pub fn new(index: usize, key: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            index,
            key: key.into(),
            content_ref: None,
            verdict: Verdict::Pending,
            attempt: 0,
            max_attempts,
            issues: Vec::new(),
            error: None,
            accepted: false,
        }
    }

    /// Whether there is any content a caller could use.
    pub fn has_content(&self) -> bool {
        self.content_ref.is_some()
    }

    pub fn regenerations(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }
}
