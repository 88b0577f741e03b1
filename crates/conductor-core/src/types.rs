use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling and delivery priority, ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Preferred over normal work.
    High,
    /// Started first, delivered first.
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered, loops not started yet.
    Initializing,
    /// Waiting for the next cycle.
    Idle,
    /// An execution is in flight.
    Running,
    /// The last execution failed or the loop faulted.
    Error,
    /// Loops stopped by an operator.
    Stopped,
    /// Scheduling suspended by an operator.
    Maintenance,
}

impl AgentStatus {
    /// Whether a dependent agent may run while its dependency is in this status.
    pub fn satisfies_dependency(self) -> bool {
        !matches!(self, AgentStatus::Error | AgentStatus::Stopped)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Initializing => write!(f, "initializing"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Stopped => write!(f, "stopped"),
            AgentStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Execution counters and timings for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Running mean over successful executions, in milliseconds.
    pub average_execution_ms: f64,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
    /// Error kind of the most recent failure.
    pub last_error_kind: Option<String>,
    /// Verbatim description of the most recent failure.
    pub last_error_message: Option<String>,
    /// Summary text returned by the most recent success.
    pub last_result: Option<String>,
}

impl AgentMetrics {
    /// Percentage of failed executions, `failed / total * 100`.
    ///
    /// Computed from the counters on each call.
    pub fn error_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.failed_executions as f64 / self.total_executions as f64 * 100.0
    }
}

/// What a work function returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Human-readable one-liner.
    pub summary: String,
    /// Structured output, free-form.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ResultSummary {
    /// Creates a summary with no structured data.
    pub fn text(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Attaches structured data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Periodic status snapshot pushed to the platform by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub agent: String,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
    pub error_rate: f64,
    pub heartbeat_degraded: bool,
    pub timestamp: DateTime<Utc>,
}

/// Record of a single execution, handed to `PlatformFacade::log_execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: uuid::Uuid,
    pub agent: String,
    pub success: bool,
    pub duration_ms: u64,
    pub summary: Option<ResultSummary>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}
