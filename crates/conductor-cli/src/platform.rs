use async_trait::async_trait;
use conductor_core::{ConductorResult, ExecutionRecord, HeartbeatSnapshot, PlatformFacade};
use serde_json::json;

/// Platform facade that only writes what it receives to the tracing log.
///
/// Stands in for a real commerce platform when running agents locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPlatform;

#[async_trait]
impl PlatformFacade for LoggingPlatform {
    async fn heartbeat(&self, agent: &str, snapshot: &HeartbeatSnapshot) -> ConductorResult<()> {
        tracing::debug!(
            agent = %agent,
            status = %snapshot.status,
            total = snapshot.metrics.total_executions,
            error_rate = snapshot.error_rate,
            degraded = snapshot.heartbeat_degraded,
            "Platform: heartbeat"
        );
        Ok(())
    }

    async fn log_execution(&self, agent: &str, record: &ExecutionRecord) -> ConductorResult<()> {
        tracing::info!(
            agent = %agent,
            execution_id = %record.execution_id,
            success = record.success,
            duration_ms = record.duration_ms,
            "Platform: execution logged"
        );
        Ok(())
    }

    async fn check_dependency(&self, name: &str) -> ConductorResult<bool> {
        tracing::debug!(dependency = %name, "Platform: dependency check");
        Ok(true)
    }

    async fn get_data(
        &self,
        data_type: &str,
        filters: &serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        tracing::info!(data_type = %data_type, filters = %filters, "Platform: data requested");
        Ok(json!([]))
    }

    async fn execute_action(
        &self,
        action: &str,
        params: &serde_json::Value,
    ) -> ConductorResult<serde_json::Value> {
        tracing::info!(action = %action, params = %params, "Platform: action executed");
        Ok(json!({ "action": action, "accepted": true }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_actions_are_accepted() {
        let platform = LoggingPlatform;
        let result = platform
            .execute_action("reprice", &json!({"sku": "A-1"}))
            .await
            .unwrap();
        assert_eq!(result["accepted"], true);
        assert!(platform.check_dependency("catalog").await.unwrap());
        assert_eq!(platform.get_data("orders", &json!({})).await.unwrap(), json!([]));
    }
}
