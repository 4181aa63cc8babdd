//! Cost of a job's usage, from a per-model price table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use inkwell_core::UsageRecord;

/// Price of one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum ModelPrice {
    /// USD per 1K input / output units
    Tokens { input_per_1k: f64, output_per_1k: f64 },
    /// USD per generated artifact
    PerArtifact { price: f64 },
}

/// Model id → price. Unknown models cost nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    models: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text_model(mut self, model: impl Into<String>, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.models.insert(
            model.into(),
            ModelPrice::Tokens {
                input_per_1k,
                output_per_1k,
            },
        );
        self
    }

    pub fn with_artifact_model(mut self, model: impl Into<String>, price: f64) -> Self {
        self.models.insert(model.into(), ModelPrice::PerArtifact { price });
        self
    }

    pub fn get(&self, model: &str) -> Option<ModelPrice> {
        self.models.get(model).copied()
    }

    /// Total USD cost of `usage`.
    ///
    /// Text units are priced per model they were recorded under; records
    /// without the per-model split fall back to the last text model.
    /// Artifacts are priced against the last artifact model. A model priced
    /// in the wrong unit contributes 0.
    pub fn cost_of(&self, usage: &UsageRecord) -> f64 {
        let mut total = 0.0;

        if usage.units_by_model.is_empty() {
            total += self.units_cost(&usage.text_model, usage.input_units, usage.output_units);
        } else {
            for (model, units) in &usage.units_by_model {
                total += self.units_cost(model, units.input_units, units.output_units);
            }
        }

        if let Some(ModelPrice::PerArtifact { price }) = self.get(&usage.artifact_model) {
            total += usage.artifact_count as f64 * price;
        }

        total
    }

    fn units_cost(&self, model: &str, input_units: u64, output_units: u64) -> f64 {
        match self.get(model) {
            Some(ModelPrice::Tokens {
                input_per_1k,
                output_per_1k,
            }) => (input_units as f64 * input_per_1k + output_units as f64 * output_per_1k) / 1000.0,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PriceTable {
        PriceTable::new()
            .with_text_model("text-large", 0.003, 0.015)
            .with_artifact_model("image-pro", 0.02)
    }

    #[test]
    fn combines_text_and_artifact_cost() {
        let usage = UsageRecord {
            input_units: 2000,
            output_units: 1000,
            text_model: "text-large".into(),
            artifact_count: 14,
            artifact_model: "image-pro".into(),
            ..Default::default()
        };

        let cost = table().cost_of(&usage);
        // 2 * 0.003 + 1 * 0.015 + 14 * 0.02
        assert!((cost - 0.301).abs() < 1e-9);
    }

    #[test]
    fn judge_calls_do_not_reprice_text_units() {
        let mut usage = UsageRecord::default();
        usage.record_llm(2000, 1000, "text-large");
        // judge recorded last, and absent from the table
        usage.record_llm(500, 100, "judge-small");

        let cost = table().cost_of(&usage);
        assert!((cost - (2.0 * 0.003 + 0.015)).abs() < 1e-9);

        let priced = table().with_text_model("judge-small", 0.001, 0.002);
        let cost = priced.cost_of(&usage);
        let expected = 2.0 * 0.003 + 0.015 + 0.5 * 0.001 + 0.1 * 0.002;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn unknown_models_are_free() {
        let usage = UsageRecord {
            input_units: 10_000,
            text_model: "mystery".into(),
            artifact_count: 3,
            artifact_model: "text-large".into(),
            ..Default::default()
        };
        assert_eq!(table().cost_of(&usage), 0.0);
    }

    #[test]
    fn table_deserializes_from_json() {
        let table: PriceTable = serde_json::from_value(serde_json::json!({
            "image-pro": {"unit": "per_artifact", "price": 0.02}
        }))
        .unwrap();
        assert_eq!(table.get("image-pro"), Some(ModelPrice::PerArtifact { price: 0.02 }));
    }
}
