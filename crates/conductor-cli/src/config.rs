use conductor_orchestrator::{AgentConfig, BuiltinAgent, OrchestratorSettings};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Contents of `conductor.toml`.
#[derive(Debug, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// One `[[agents]]` entry: the agent's configuration plus its work variant.
#[derive(Debug, Deserialize)]
pub struct AgentSpec {
    #[serde(flatten)]
    pub config: AgentConfig,
    pub work: BuiltinAgent,
}

impl ConductorConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: ConductorConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid settings, invalid agents and duplicate names; warn
    /// about dependencies that no configured agent provides.
    fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator.validate()?;
        let mut names = HashSet::new();
        for spec in &self.agents {
            spec.config.validate()?;
            if !names.insert(spec.config.name.as_str()) {
                anyhow::bail!("agent '{}' is defined more than once", spec.config.name);
            }
        }
        for spec in &self.agents {
            for dep in &spec.config.dependencies {
                if !names.contains(dep.as_str()) {
                    tracing::warn!(
                        agent = %spec.config.name,
                        dependency = %dep,
                        "Dependency is not defined in this config; agent will be gated until it registers"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::Priority;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = r#"
[orchestrator]
heartbeat_interval_ms = 10000
stop_grace_period_ms = 2000

[[agents]]
name = "catalog"
interval_ms = 60000
timeout_ms = 10000
priority = "critical"
capabilities = ["catalog"]
work = { kind = "echo", summary = "catalog refreshed" }

[[agents]]
name = "fulfillment"
interval_ms = 5000
timeout_ms = 2000
dependencies = ["catalog"]

[agents.work]
kind = "inbox"
"#;

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ConductorConfig::load(file.path()).await.unwrap();
        assert_eq!(config.orchestrator.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.orchestrator.log_capacity, 200);
        assert_eq!(config.agents.len(), 2);

        let catalog = &config.agents[0];
        assert_eq!(catalog.config.priority, Priority::Critical);
        assert_eq!(
            catalog.work,
            BuiltinAgent::Echo {
                summary: "catalog refreshed".into()
            }
        );
        let fulfillment = &config.agents[1];
        assert_eq!(fulfillment.config.execution_timeout, Duration::from_secs(2));
        assert!(fulfillment.config.dependencies.contains("catalog"));
        assert!(matches!(fulfillment.work, BuiltinAgent::Inbox { .. }));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConductorConfig::load(&dir.path().join("nope.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let raw = r#"
[[agents]]
name = "a"
interval_ms = 1000
timeout_ms = 500
work = { kind = "noop" }

[[agents]]
name = "a"
interval_ms = 1000
timeout_ms = 500
work = { kind = "noop" }
"#;
        let err = ConductorConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let raw = r#"
[[agents]]
name = "a"
interval_ms = 0
timeout_ms = 500
work = { kind = "noop" }
"#;
        assert!(ConductorConfig::parse(raw).is_err());
    }

    #[test]
    fn test_rejects_zero_heartbeat_interval() {
        let raw = r#"
[orchestrator]
heartbeat_interval_ms = 0
"#;
        let err = ConductorConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_ms"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConductorConfig::parse("").unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.orchestrator.heartbeat_failure_threshold, 3);
    }
}
