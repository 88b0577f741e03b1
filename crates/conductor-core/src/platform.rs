use crate::error::ConductorResult;
use crate::types::{ExecutionRecord, HeartbeatSnapshot};
use async_trait::async_trait;

/// The outward-facing platform the orchestrator and agent work functions talk to.
///
/// The orchestrator itself only calls [`heartbeat`](Self::heartbeat); the
/// remaining operations are used by work functions through their context.
/// Implementations own all network I/O to external providers.
#[async_trait]
pub trait PlatformFacade: Send + Sync {
    /// Receive a status snapshot for `agent`.
    async fn heartbeat(&self, agent: &str, snapshot: &HeartbeatSnapshot) -> ConductorResult<()>;

    /// Persist the outcome of one execution.
    async fn log_execution(&self, agent: &str, record: &ExecutionRecord) -> ConductorResult<()>;

    /// Whether an external dependency is reachable.
    async fn check_dependency(&self, name: &str) -> ConductorResult<bool>;

    /// Fetch data of `data_type` matching `filters`.
    async fn get_data(
        &self,
        data_type: &str,
        filters: &serde_json::Value,
    ) -> ConductorResult<serde_json::Value>;

    /// Run a named action on the platform.
    async fn execute_action(
        &self,
        action: &str,
        params: &serde_json::Value,
    ) -> ConductorResult<serde_json::Value>;
}

/// A platform that accepts every call and returns empty data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlatform;

#[async_trait]
impl PlatformFacade for NullPlatform {
    async fn heartbeat(&self, _agent: &str, _snapshot: &HeartbeatSnapshot) -> ConductorResult<()> {
        Ok(())
    }

    async fn log_execution(&self, _agent: &str, _record: &ExecutionRecord) -> ConductorResult<()> {
        Ok(())
    }

    async fn check_dependency(&self, _name: &str) -> ConductorResult<bool> {
        Ok(true)
    }

    async fn get_data(
        &self,
        _data_type: &str,
        _filters: &serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn execute_action(
        &self,
        _action: &str,
        _params: &serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}
