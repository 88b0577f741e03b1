//! Agent orchestration core: registry, scheduling, health and messaging.
//!
//! Every registered agent owns two independent loops, an execution loop that
//! runs its work on an interval (or cron schedule) under a timeout and a
//! single-flight lock, and a heartbeat loop that pushes status snapshots to the
//! platform. Agents exchange messages through a priority bus with expiry and
//! response tracking.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Facade for registering, starting, stopping and querying agents.
//! - [`AgentRegistry`]: Concurrent map of agent configuration and runtime state.
//! - [`ExecutionScheduler`]: One scheduling loop per agent.
//! - [`HealthMonitor`]: One heartbeat loop per agent.
//! - [`MessageBus`]: Per-recipient priority queues between agents.
//! - [`AgentWork`]: The unit of work an agent performs.

/// Built-in, config-selectable agent work.
pub mod builtin;
/// Inter-agent message bus.
pub mod bus;
/// Orchestrator-wide settings.
pub mod config;
/// Heartbeat loops.
pub mod health;
/// Bounded per-agent execution log.
pub mod logs;
/// Execution metrics.
pub mod metrics;
/// The orchestrator facade.
pub mod orchestrator;
/// Agent registry and runtime state.
pub mod registry;
/// Execution scheduling loops.
pub mod scheduler;
/// Agent configuration and read models.
pub mod types;
/// Work function interface.
pub mod work;

pub use builtin::BuiltinAgent;
pub use bus::{BusStats, Delivery, FailureReason, MessageBus, DELIVERY_FAILED_SUBJECT, SYSTEM_SENDER};
pub use config::OrchestratorSettings;
pub use health::HealthMonitor;
pub use logs::{LogEntry, LogLevel, LogStore};
pub use metrics::MetricsCollector;
pub use orchestrator::Orchestrator;
pub use registry::{AgentEntry, AgentRegistry, AgentRuntimeState};
pub use scheduler::{next_fire_time, parse_cron, ExecutionScheduler};
pub use types::{
    AgentConfig, AgentFilter, AgentState, AgentStatusReport, ExecutionOutcome, Trigger,
};
pub use work::{work_fn, AgentContext, AgentWork, FnWork};
