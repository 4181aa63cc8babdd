//! Shared per-job usage accumulator.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use inkwell_ai::CallUsage;
use inkwell_core::UsageRecord;

/// Handle to one job's usage counters.
///
/// Cloning the handle shares the same record: every fan-out worker gets a
/// clone moved into its task, and each mutation takes the lock for the
/// duration of a single increment.
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    inner: Arc<Mutex<UsageRecord>>,
}

impl UsageAccumulator {
    /// Fresh, zeroed accumulator for a new job.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn record_llm(&self, input_units: u64, output_units: u64, model: &str) {
        self.lock().record_llm(input_units, output_units, model);
    }

    pub fn record_llm_timed(&self, input_units: u64, output_units: u64, model: &str, elapsed: Duration) {
        let mut usage = self.lock();
        usage.record_llm(input_units, output_units, model);
        usage.record_llm_duration(elapsed.as_millis() as u64);
    }

    /// Record a provider call's self-reported usage.
    pub fn record_call(&self, call: &CallUsage) {
        let mut usage = self.lock();
        usage.record_llm(call.input_units, call.output_units, &call.model);
        if let Some(ms) = call.duration_ms {
            usage.record_llm_duration(ms);
        }
    }

    pub fn record_artifact(&self, model: &str, was_retry: bool) {
        self.lock().record_artifact(model, was_retry);
    }

    pub fn snapshot(&self) -> UsageRecord {
        self.lock().clone()
    }

    /// Whether two handles point at the same record.
    pub fn shares_with(&self, other: &UsageAccumulator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, UsageRecord> {
        // Counters stay meaningful after a panicking writer.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
