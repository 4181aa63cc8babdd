//! Turning a failed verdict into an augmented request.

use std::collections::BTreeMap;

use inkwell_core::{Issue, IssueCategory};

use crate::capability::{ArtifactRequest, Avoidance};

/// Build the retry request for `original` given the issues of the last verdict.
///
/// Issues are grouped per category, one `Avoidance` each, in a stable
/// category order. Always derived from the original request: feedback from
/// earlier attempts is replaced, not stacked.
pub fn augment_request(original: &ArtifactRequest, issues: &[Issue]) -> ArtifactRequest {
    let mut grouped: BTreeMap<IssueCategory, Vec<String>> = BTreeMap::new();
    for issue in issues {
        let details = grouped.entry(issue.category).or_default();
        if !issue.detail.is_empty() && !details.contains(&issue.detail) {
            details.push(issue.detail.clone());
        }
    }

    let mut augmented = original.clone();
    augmented.avoid = grouped
        .into_iter()
        .map(|(category, details)| Avoidance { category, details })
        .collect();
    augmented
}

impl ArtifactRequest {
    /// Prompt with one avoidance line per category appended.
    pub fn render_prompt(&self) -> String {
        if self.avoid.is_empty() {
            return self.prompt.clone();
        }

        let mut out = self.prompt.clone();
        out.push_str("\n\nAvoid these issues from the previous attempt:");
        for avoidance in &self.avoid {
            let details = if avoidance.details.is_empty() {
                default_detail(avoidance.category).to_string()
            } else {
                avoidance.details.join("; ")
            };
            out.push_str(&format!("\n- {}: {}", avoidance.category, details));
        }
        out
    }
}

fn default_detail(category: IssueCategory) -> &'static str {
    match category {
        IssueCategory::Text => "no lettering, signs or writing of any kind",
        IssueCategory::Character => "entities must match their references",
        IssueCategory::Composition => "clear focal point and balanced layout",
        IssueCategory::Style => "keep the established style",
        IssueCategory::Other => "previous output was rejected",
    }
}
