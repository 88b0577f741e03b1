//! Core types and error definitions for the Conductor orchestrator.
//!
//! This crate provides the foundational types shared by the orchestrator and
//! by agent work functions: error handling, agent status and metrics, the
//! inter-agent message model, and the platform facade interface.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all orchestrator subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`AgentStatus`]: Lifecycle status of a registered agent.
//! - [`AgentMetrics`]: Per-agent execution counters and timings.
//! - [`Message`]: A message routed between agents.
//! - [`PlatformFacade`]: External collaborator receiving heartbeats and actions.

/// Error types.
pub mod error;
/// Inter-agent message model.
pub mod message;
/// Platform facade interface.
pub mod platform;
/// Shared status, priority and metrics types.
pub mod types;

pub use error::{ConductorError, ConductorResult};
pub use message::{Message, MessageStatus, MessageType};
pub use platform::{NullPlatform, PlatformFacade};
pub use types::{
    AgentMetrics, AgentStatus, ExecutionRecord, HeartbeatSnapshot, Priority, ResultSummary,
};
