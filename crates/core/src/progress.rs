//! Stage-weighted progress snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stage a progress update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Text,
    References,
    Illustrations,
    Complete,
    Failed,
}

impl Stage {
    /// Fixed percentage band `[start, end]` the stage maps onto.
    ///
    /// `Failed` has no band; a failure freezes the last reported percentage.
    pub fn range(&self) -> Option<(u8, u8)> {
        match self {
            Stage::Text => Some((0, 15)),
            Stage::References => Some((15, 40)),
            Stage::Illustrations => Some((40, 100)),
            Stage::Complete => Some((100, 100)),
            Stage::Failed => None,
        }
    }

    /// Percentage for `completed / total` inside this stage's band.
    ///
    /// Interpolates linearly and truncates. Without counters (or with
    /// `total == 0`) the stage start is used.
    pub fn percentage(&self, completed: Option<u32>, total: Option<u32>) -> Option<u8> {
        let (start, end) = self.range()?;
        match (completed, total) {
            (Some(completed), Some(total)) if total > 0 => {
                let fraction = f64::from(completed.min(total)) / f64::from(total);
                let span = f64::from(end - start);
                Some(start + (span * fraction) as u8)
            }
            _ => Some(start),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Text => "text",
            Stage::References => "references",
            Stage::Illustrations => "illustrations",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
        }
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress blob, one per job, overwritten on each write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub stage: Stage,
    pub stage_detail: String,
    /// 0..=100
    pub percentage: u8,
    pub completed: Option<u32>,
    pub total: Option<u32>,
    /// Non-fatal problems, appended over the job's lifetime
    pub warnings: Vec<String>,
    pub updated_at: DateTime<Utc>,
}
