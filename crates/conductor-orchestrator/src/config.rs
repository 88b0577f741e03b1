use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Orchestrator-wide tuning knobs.
///
/// Every field has a default so a partial `[orchestrator]` table (or none at
/// all) is accepted. Durations are written in milliseconds in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Period of each agent's heartbeat loop.
    #[serde(
        rename = "heartbeat_interval_ms",
        with = "duration_ms",
        default = "default_heartbeat_interval"
    )]
    pub heartbeat_interval: Duration,
    /// Upper bound on a single heartbeat push.
    #[serde(
        rename = "heartbeat_timeout_ms",
        with = "duration_ms",
        default = "default_heartbeat_timeout"
    )]
    pub heartbeat_timeout: Duration,
    /// Consecutive failed pushes before an agent is flagged heartbeat-degraded.
    #[serde(default = "default_heartbeat_failure_threshold")]
    pub heartbeat_failure_threshold: u32,
    /// Pause after an internal scheduler fault.
    #[serde(
        rename = "fault_cool_down_ms",
        with = "duration_ms",
        default = "default_fault_cool_down"
    )]
    pub fault_cool_down: Duration,
    /// How long stop/deregister wait for an in-flight execution.
    #[serde(
        rename = "stop_grace_period_ms",
        with = "duration_ms",
        default = "default_stop_grace_period"
    )]
    pub stop_grace_period: Duration,
    /// Execution log entries kept per agent.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Period of the bus response-timeout sweep.
    #[serde(
        rename = "bus_sweep_interval_ms",
        with = "duration_ms",
        default = "default_bus_sweep_interval"
    )]
    pub bus_sweep_interval: Duration,
    /// Response timeout for messages that require one but don't set it.
    #[serde(
        rename = "default_response_timeout_ms",
        with = "duration_ms",
        default = "default_response_timeout"
    )]
    pub default_response_timeout: Duration,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_heartbeat_failure_threshold() -> u32 {
    3
}
fn default_fault_cool_down() -> Duration {
    Duration::from_secs(60)
}
fn default_stop_grace_period() -> Duration {
    Duration::from_secs(10)
}
fn default_log_capacity() -> usize {
    200
}
fn default_bus_sweep_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_response_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            heartbeat_failure_threshold: default_heartbeat_failure_threshold(),
            fault_cool_down: default_fault_cool_down(),
            stop_grace_period: default_stop_grace_period(),
            log_capacity: default_log_capacity(),
            bus_sweep_interval: default_bus_sweep_interval(),
            default_response_timeout: default_response_timeout(),
        }
    }
}

impl OrchestratorSettings {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_fault_cool_down(mut self, cool_down: Duration) -> Self {
        self.fault_cool_down = cool_down;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_bus_sweep_interval(mut self, interval: Duration) -> Self {
        self.bus_sweep_interval = interval;
        self
    }

    /// Reject settings the heartbeat and bus loops cannot run with.
    pub fn validate(&self) -> ConductorResult<()> {
        let periods = [
            ("heartbeat_interval_ms", self.heartbeat_interval),
            ("heartbeat_timeout_ms", self.heartbeat_timeout),
            ("bus_sweep_interval_ms", self.bus_sweep_interval),
        ];
        for (key, value) in periods {
            if value.is_zero() {
                return Err(ConductorError::Config(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        if self.heartbeat_failure_threshold == 0 {
            return Err(ConductorError::Config(
                "heartbeat_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.fault_cool_down, Duration::from_secs(60));
        assert_eq!(settings.heartbeat_failure_threshold, 3);
        assert_eq!(settings.log_capacity, 200);
    }

    #[test]
    fn test_partial_toml() {
        let settings: OrchestratorSettings = toml::from_str(
            r#"
            heartbeat_interval_ms = 1500
            log_capacity = 10
            "#,
        )
        .unwrap();
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(settings.log_capacity, 10);
        assert_eq!(settings.stop_grace_period, Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        assert!(OrchestratorSettings::default().validate().is_ok());

        for key in ["heartbeat_interval_ms", "heartbeat_timeout_ms", "bus_sweep_interval_ms"] {
            let settings: OrchestratorSettings = toml::from_str(&format!("{key} = 0")).unwrap();
            let err = settings.validate().unwrap_err();
            assert!(matches!(err, ConductorError::Config(_)));
            assert!(err.to_string().contains(key));
        }

        let settings: OrchestratorSettings =
            toml::from_str("heartbeat_failure_threshold = 0").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let settings = OrchestratorSettings::default().with_fault_cool_down(Duration::from_millis(250));
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["fault_cool_down_ms"], 250);
        let back: OrchestratorSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back.fault_cool_down, Duration::from_millis(250));
    }
}
