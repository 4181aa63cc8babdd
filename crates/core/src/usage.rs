//! Per-job resource usage counters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Token-style units consumed by one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelUnits {
    pub input_units: u64,
    pub output_units: u64,
}

/// Resource usage of a single job across all of its workers.
///
/// Plain data; concurrent mutation goes through the infra accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageRecord {
    pub input_units: u64,
    pub output_units: u64,
    /// Last text model recorded
    pub text_model: String,
    pub call_count: u64,
    pub artifact_count: u64,
    /// Last artifact model recorded
    pub artifact_model: String,
    pub artifact_retries: u64,
    pub llm_duration_ms: u64,
    pub llm_durations_ms: Vec<u64>,
    /// Units split by model, so text and judge calls are priced separately
    pub units_by_model: BTreeMap<String, ModelUnits>,
}

impl UsageRecord {
    pub fn record_llm(&mut self, input_units: u64, output_units: u64, model: &str) {
        self.input_units += input_units;
        self.output_units += output_units;
        self.call_count += 1;
        if !model.is_empty() {
            self.text_model = model.to_string();
            let units = self.units_by_model.entry(model.to_string()).or_default();
            units.input_units += input_units;
            units.output_units += output_units;
        }
    }

    pub fn record_llm_duration(&mut self, duration_ms: u64) {
        self.llm_duration_ms += duration_ms;
        self.llm_durations_ms.push(duration_ms);
    }

    pub fn record_artifact(&mut self, model: &str, was_retry: bool) {
        self.artifact_count += 1;
        if !model.is_empty() {
            self.artifact_model = model.to_string();
        }
        if was_retry {
            self.artifact_retries += 1;
        }
    }
}
