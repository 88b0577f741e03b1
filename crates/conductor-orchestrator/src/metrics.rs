use chrono::Utc;
use conductor_core::{AgentMetrics, ResultSummary};
use dashmap::DashMap;
use std::time::Duration;

/// Accumulates per-agent execution counters.
///
/// Only the scheduler writes here, right after an execution attempt, and the
/// single-flight lock keeps writes for one agent strictly ordered.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: DashMap<String, AgentMetrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `name` from zeroed counters, discarding anything recorded before.
    pub fn reset(&self, name: &str) {
        self.metrics.insert(name.to_string(), AgentMetrics::default());
    }

    /// Record a successful execution and fold `duration` into the running mean.
    pub fn record_success(&self, name: &str, duration: Duration, result: &ResultSummary) {
        let now = Utc::now();
        let mut m = self.metrics.entry(name.to_string()).or_default();
        m.total_executions += 1;
        m.successful_executions += 1;
        let ms = duration.as_secs_f64() * 1000.0;
        m.average_execution_ms += (ms - m.average_execution_ms) / m.successful_executions as f64;
        m.last_execution = Some(now);
        m.last_success = Some(now);
        m.last_result = Some(result.summary.clone());
    }

    /// Record a failed execution with its error kind and verbatim description.
    pub fn record_failure(&self, name: &str, error_kind: &str, description: &str) {
        let now = Utc::now();
        let mut m = self.metrics.entry(name.to_string()).or_default();
        m.total_executions += 1;
        m.failed_executions += 1;
        m.last_execution = Some(now);
        m.last_error = Some(now);
        m.last_error_kind = Some(error_kind.to_string());
        m.last_error_message = Some(description.to_string());
    }

    /// Current counters for `name`; zeroed if nothing was recorded.
    pub fn snapshot(&self, name: &str) -> AgentMetrics {
        self.metrics
            .get(name)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    pub(crate) fn remove(&self, name: &str) {
        self.metrics.remove(name);
    }
}
