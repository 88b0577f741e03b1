use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor orchestrator.
///
/// Each variant corresponds to one class of failure the orchestrator can
/// report: configuration problems are rejected at registration, execution
/// failures are recorded against the agent, and the rest surface from the
/// facade operations.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// Invalid agent or orchestrator configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// An agent with this name is already registered.
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),

    /// No agent with this name is registered.
    #[error("Agent '{0}' not found")]
    AgentNotFound(String),

    /// The agent has an execution in flight.
    #[error("Agent '{0}' is busy")]
    Busy(String),

    /// The requested operation is not allowed in the agent's current state.
    #[error("Invalid state for agent '{agent}': {reason}")]
    InvalidState {
        /// Agent the operation targeted.
        agent: String,
        /// Why the operation was refused.
        reason: String,
    },

    /// The work function did not finish within its execution timeout.
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// The work function returned an error.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A declared dependency is not registered or not healthy.
    #[error("Dependency not satisfied: {0}")]
    DependencyNotSatisfied(String),

    /// A message could not be routed or tracked.
    #[error("Message bus error: {0}")]
    Bus(String),

    /// The external platform facade rejected a call.
    #[error("Platform error: {0}")]
    Platform(String),

    /// A fault inside the scheduling machinery itself.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Short, stable identifier of the error class.
    ///
    /// Recorded as the error kind in agent metrics and execution logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConductorError::Config(_) => "config",
            ConductorError::DuplicateAgent(_) => "duplicate_agent",
            ConductorError::AgentNotFound(_) => "not_found",
            ConductorError::Busy(_) => "busy",
            ConductorError::InvalidState { .. } => "invalid_state",
            ConductorError::Timeout(_) => "timeout",
            ConductorError::Execution(_) => "execution",
            ConductorError::DependencyNotSatisfied(_) => "dependency_not_satisfied",
            ConductorError::Bus(_) => "bus",
            ConductorError::Platform(_) => "platform",
            ConductorError::Scheduler(_) => "scheduler",
            ConductorError::Serialization(_) => "serialization",
            ConductorError::Io(_) => "io",
        }
    }

    /// Whether this error is the single-flight rejection.
    pub fn is_busy(&self) -> bool {
        matches!(self, ConductorError::Busy(_))
    }
}
