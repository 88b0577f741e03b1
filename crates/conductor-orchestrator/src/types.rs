use crate::config::duration_ms;
use chrono::{DateTime, Utc};
use conductor_core::{
    AgentMetrics, AgentStatus, ConductorError, ConductorResult, Priority, ResultSummary,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Immutable configuration of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique key in the registry.
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Capability tags, used for filtering.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Agents that must be registered and healthy before this one runs.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub execution_interval: Duration,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub execution_timeout: Duration,
    /// Optional 7-field cron expression; replaces the interval sleep when set.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Retry attempts after a failure before the agent is quarantined.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Free-form settings handed to the work function.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_enabled() -> bool {
    true
}

impl AgentConfig {
    /// Create a config with a 60s interval and 30s timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            execution_interval: Duration::from_secs(60),
            execution_timeout: Duration::from_secs(30),
            schedule: None,
            max_retries: default_max_retries(),
            priority: Priority::Normal,
            enabled: true,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.execution_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_schedule(mut self, cron_expr: impl Into<String>) -> Self {
        self.schedule = Some(cron_expr.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reject configurations that must never reach the scheduler.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConductorError::Config("agent name must not be empty".into()));
        }
        if self.execution_interval.is_zero() {
            return Err(ConductorError::Config(format!(
                "agent '{}': execution interval must be greater than zero",
                self.name
            )));
        }
        if self.execution_timeout.is_zero() {
            return Err(ConductorError::Config(format!(
                "agent '{}': execution timeout must be greater than zero",
                self.name
            )));
        }
        if self.dependencies.contains(&self.name) {
            return Err(ConductorError::Config(format!(
                "agent '{}' cannot depend on itself",
                self.name
            )));
        }
        if let Some(expr) = &self.schedule {
            crate::scheduler::parse_cron(expr)?;
        }
        if self.execution_timeout >= self.execution_interval {
            tracing::warn!(
                agent = %self.name,
                timeout_ms = self.execution_timeout.as_millis() as u64,
                interval_ms = self.execution_interval.as_millis() as u64,
                "Execution timeout is not shorter than the interval"
            );
        }
        Ok(())
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// The agent's scheduling loop.
    Scheduled,
    /// An operator's execute-now request.
    Manual,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub agent: String,
    pub trigger: Trigger,
    pub success: bool,
    pub duration_ms: u64,
    pub summary: Option<ResultSummary>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Selection criteria for `list`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub capability: Option<String>,
    pub status: Option<AgentStatus>,
    pub heartbeat_degraded: Option<bool>,
}

impl AgentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn capability(capability: impl Into<String>) -> Self {
        Self {
            capability: Some(capability.into()),
            ..Self::default()
        }
    }

    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn heartbeat_degraded() -> Self {
        Self {
            heartbeat_degraded: Some(true),
            ..Self::default()
        }
    }
}

/// Last committed runtime state of an agent, safe to hand out.
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub in_flight: Option<Uuid>,
    pub running_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub quarantined: bool,
    pub heartbeat_degraded: bool,
    pub registered_at: DateTime<Utc>,
}

/// Read model returned by `get-status` and `list-agents`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusReport {
    pub name: String,
    pub version: String,
    pub description: String,
    pub priority: Priority,
    pub enabled: bool,
    pub capabilities: BTreeSet<String>,
    pub dependencies: BTreeSet<String>,
    #[serde(flatten)]
    pub state: AgentState,
    pub heartbeat_stale: bool,
    pub metrics: AgentMetrics,
    pub error_rate: f64,
}
