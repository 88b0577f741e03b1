use crate::config::OrchestratorSettings;
use crate::logs::{LogLevel, LogStore};
use crate::metrics::MetricsCollector;
use crate::registry::AgentEntry;
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult, HeartbeatSnapshot, PlatformFacade};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Number of heartbeat periods without a successful push before an agent is
/// reported stale.
const STALE_PERIODS: u32 = 3;

#[derive(Debug)]
struct MonitorLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Pushes periodic heartbeat snapshots to the platform, one loop per agent.
///
/// Only reads state snapshots, so it never waits on an agent's execution.
/// Push failures never change the agent's status; after
/// `heartbeat_failure_threshold` consecutive failures the agent is flagged
/// heartbeat-degraded until the next successful push.
pub struct HealthMonitor {
    metrics: Arc<MetricsCollector>,
    logs: Arc<LogStore>,
    platform: Arc<dyn PlatformFacade>,
    settings: OrchestratorSettings,
    loops: DashMap<String, MonitorLoop>,
}

impl HealthMonitor {
    pub fn new(
        metrics: Arc<MetricsCollector>,
        logs: Arc<LogStore>,
        platform: Arc<dyn PlatformFacade>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            metrics,
            logs,
            platform,
            settings,
            loops: DashMap::new(),
        }
    }

    /// Spawn the heartbeat loop for `entry`. The first push is immediate.
    pub fn start(self: &Arc<Self>, entry: Arc<AgentEntry>) -> ConductorResult<()> {
        match self.loops.entry(entry.name().to_string()) {
            Entry::Occupied(_) => Err(ConductorError::InvalidState {
                agent: entry.name().to_string(),
                reason: "heartbeat loop is already running".into(),
            }),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let this = Arc::clone(self);
                let token = cancel.clone();
                let handle = tokio::spawn(async move { this.run_loop(entry, token).await });
                slot.insert(MonitorLoop {
                    cancel,
                    handle,
                    started_at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Cancel `name`'s heartbeat loop and wait for it to exit. No-op when not running.
    pub async fn stop(&self, name: &str) {
        if let Some((_, monitor)) = self.loops.remove(name) {
            monitor.cancel.cancel();
            let _ = monitor.handle.await;
            tracing::debug!(agent = %name, "Health: heartbeat loop stopped");
        }
    }

    /// Cancel every heartbeat loop without waiting for it to exit.
    pub(crate) fn cancel_all(&self) {
        let names: Vec<String> = self.loops.iter().map(|l| l.key().clone()).collect();
        for name in names {
            if let Some((_, monitor)) = self.loops.remove(&name) {
                monitor.cancel.cancel();
                monitor.handle.abort();
            }
        }
    }

    pub fn is_monitoring(&self, name: &str) -> bool {
        self.loops.contains_key(name)
    }

    async fn run_loop(self: Arc<Self>, entry: Arc<AgentEntry>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.beat(&entry) => {}
            }
        }
    }

    /// Push one snapshot for `entry`, bounded by `heartbeat_timeout`, and
    /// update its heartbeat bookkeeping.
    pub async fn beat(&self, entry: &AgentEntry) -> ConductorResult<()> {
        let name = entry.name();
        let state = entry.state();
        let metrics = self.metrics.snapshot(name);
        let snapshot = HeartbeatSnapshot {
            agent: name.to_string(),
            status: state.status,
            error_rate: metrics.error_rate(),
            metrics,
            heartbeat_degraded: state.heartbeat_degraded,
            timestamp: Utc::now(),
        };

        let limit = self.settings.heartbeat_timeout;
        let result = match tokio::time::timeout(limit, self.platform.heartbeat(name, &snapshot)).await
        {
            Ok(pushed) => pushed,
            Err(_) => Err(ConductorError::Timeout(limit)),
        };

        match &result {
            Ok(()) => {
                let recovered = entry.update(|s| {
                    s.last_heartbeat = Some(snapshot.timestamp);
                    s.heartbeat_failures = 0;
                    std::mem::replace(&mut s.heartbeat_degraded, false)
                });
                if recovered {
                    tracing::info!(agent = %name, "Health: heartbeat recovered");
                    self.logs
                        .record(name, LogLevel::Info, "Heartbeat recovered", json!({}));
                }
            }
            Err(e) => {
                let threshold = self.settings.heartbeat_failure_threshold;
                let (failures, degraded_now) = entry.update(|s| {
                    s.heartbeat_failures += 1;
                    let newly = !s.heartbeat_degraded && s.heartbeat_failures >= threshold;
                    if newly {
                        s.heartbeat_degraded = true;
                    }
                    (s.heartbeat_failures, newly)
                });
                tracing::warn!(agent = %name, error = %e, failures, "Health: heartbeat push failed");
                if degraded_now {
                    tracing::warn!(agent = %name, failures, "Health: agent marked heartbeat-degraded");
                    self.logs.record(
                        name,
                        LogLevel::Warn,
                        "Heartbeat degraded",
                        json!({ "consecutive_failures": failures, "error": e.to_string() }),
                    );
                }
            }
        }
        result
    }

    /// Whether `name`'s monitor has been running for more than three periods
    /// without a successful heartbeat in the last three.
    pub fn is_stale(&self, name: &str, last_heartbeat: Option<DateTime<Utc>>) -> bool {
        let Some(started_at) = self.loops.get(name).map(|l| l.started_at) else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(self.settings.heartbeat_interval * STALE_PERIODS)
        else {
            return false;
        };
        let now = Utc::now();
        if now - started_at <= window {
            return false;
        }
        last_heartbeat.map_or(true, |at| now - at > window)
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("settings", &self.settings)
            .field("loops", &self.loops.len())
            .finish_non_exhaustive()
    }
}
