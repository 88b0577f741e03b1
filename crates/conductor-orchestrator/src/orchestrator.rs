use crate::bus::MessageBus;
use crate::config::OrchestratorSettings;
use crate::health::HealthMonitor;
use crate::logs::{LogEntry, LogLevel, LogStore};
use crate::metrics::MetricsCollector;
use crate::registry::{AgentEntry, AgentRegistry};
use crate::scheduler::ExecutionScheduler;
use crate::types::{AgentConfig, AgentFilter, AgentStatusReport, ExecutionOutcome, Trigger};
use crate::work::AgentWork;
use chrono::Utc;
use conductor_core::{
    AgentMetrics, AgentStatus, ConductorError, ConductorResult, PlatformFacade,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Single entry point for operators and dashboards.
///
/// Wires the registry, metrics, execution log, message bus, scheduler and
/// health monitor together. Starting or stopping an agent starts or stops both
/// its scheduling loop and its heartbeat loop.
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: Arc<AgentRegistry>,
    metrics: Arc<MetricsCollector>,
    logs: Arc<LogStore>,
    bus: Arc<MessageBus>,
    scheduler: Arc<ExecutionScheduler>,
    health: Arc<HealthMonitor>,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Orchestrator {
    /// Build an orchestrator with no agents. Fails if `settings` are invalid.
    pub fn new(
        settings: OrchestratorSettings,
        platform: Arc<dyn PlatformFacade>,
    ) -> ConductorResult<Self> {
        settings.validate()?;
        let registry = Arc::new(AgentRegistry::new());
        let metrics = Arc::new(MetricsCollector::new());
        let logs = Arc::new(LogStore::new(settings.log_capacity));
        let bus = Arc::new(MessageBus::new(
            registry.clone(),
            settings.default_response_timeout,
        ));
        let scheduler = Arc::new(ExecutionScheduler::new(
            registry.clone(),
            metrics.clone(),
            logs.clone(),
            bus.clone(),
            platform.clone(),
            settings.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            metrics.clone(),
            logs.clone(),
            platform,
            settings.clone(),
        ));
        Ok(Self {
            settings,
            registry,
            metrics,
            logs,
            bus,
            scheduler,
            health,
            sweeper: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// The message bus agents use to talk to each other.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Register a new agent. Its metrics start from zero.
    pub fn register_agent(
        &self,
        config: AgentConfig,
        work: Arc<dyn AgentWork>,
    ) -> ConductorResult<()> {
        let entry = self.registry.register(config, work)?;
        let config = entry.config();
        self.metrics.reset(&config.name);
        info!(agent = %config.name, version = %config.version, priority = %config.priority, "Orchestrator: agent registered");
        self.logs.record(
            &config.name,
            LogLevel::Info,
            "Agent registered",
            json!({ "version": config.version, "priority": config.priority }),
        );
        Ok(())
    }

    /// Stop an agent's loops and remove it with its metrics, logs and queue.
    ///
    /// Fails with [`ConductorError::Busy`] if an execution is still in flight
    /// after the stop grace period; the agent is then left registered and
    /// `Stopped`.
    pub async fn deregister_agent(&self, name: &str) -> ConductorResult<()> {
        let entry = self.registry.lookup(name)?;
        self.health.stop(name).await;
        self.scheduler.stop(&entry, false).await?;

        self.registry.remove(name);
        self.metrics.remove(name);
        self.logs.remove(name);
        self.bus.drop_queue(name);
        info!(agent = %name, "Orchestrator: agent deregistered");
        Ok(())
    }

    /// Start the scheduling and heartbeat loops of an `Initializing` or `Idle` agent.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_agent(&self, name: &str) -> ConductorResult<()> {
        let entry = self.registry.lookup(name)?;
        if self.scheduler.is_running(name) {
            return Err(ConductorError::InvalidState {
                agent: name.to_string(),
                reason: "agent is already started".into(),
            });
        }
        entry.update(|s| match s.status {
            AgentStatus::Initializing | AgentStatus::Idle => {
                s.status = AgentStatus::Idle;
                Ok(())
            }
            other => Err(ConductorError::InvalidState {
                agent: name.to_string(),
                reason: format!("cannot start while {other}"),
            }),
        })?;

        self.scheduler.start(entry.clone())?;
        if !self.health.is_monitoring(name) {
            self.health.start(entry)?;
        }
        self.ensure_sweeper();
        info!(agent = %name, "Orchestrator: agent started");
        self.logs
            .record(name, LogLevel::Info, "Agent started", json!({}));
        Ok(())
    }

    /// Stop both loops of an agent, forcing the stop after the grace period.
    /// Stopping an already stopped agent succeeds.
    pub async fn stop_agent(&self, name: &str) -> ConductorResult<()> {
        let entry = self.registry.lookup(name)?;
        let was_stopped = entry.status() == AgentStatus::Stopped;
        self.health.stop(name).await;
        self.scheduler.stop(&entry, true).await?;
        if !was_stopped {
            self.logs
                .record(name, LogLevel::Info, "Agent stopped", json!({}));
        }
        Ok(())
    }

    /// Run an agent's work right away, outside its schedule.
    ///
    /// Fails fast with [`ConductorError::Busy`] if an execution is already in
    /// flight. Allowed for disabled and not yet started agents; refused while
    /// `Stopped` or in `Maintenance`.
    pub async fn execute_now(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> ConductorResult<ExecutionOutcome> {
        let entry = self.registry.lookup(name)?;
        self.scheduler.execute(&entry, Trigger::Manual, params).await
    }

    /// Last committed state of an agent. Never waits on a running execution.
    pub fn get_status(&self, name: &str) -> ConductorResult<AgentStatusReport> {
        let entry = self.registry.lookup(name)?;
        Ok(self.report(&entry))
    }

    pub fn get_metrics(&self, name: &str) -> ConductorResult<AgentMetrics> {
        self.registry.lookup(name)?;
        Ok(self.metrics.snapshot(name))
    }

    /// Status reports of the agents matching `filter`, critical priority first.
    pub fn list_agents(&self, filter: &AgentFilter) -> Vec<AgentStatusReport> {
        self.registry
            .list(filter)
            .iter()
            .map(|entry| self.report(entry))
            .collect()
    }

    /// Up to `limit` execution log entries at or above `min_level`, newest first.
    pub fn get_logs(
        &self,
        name: &str,
        limit: usize,
        min_level: Option<LogLevel>,
    ) -> ConductorResult<Vec<LogEntry>> {
        self.registry.lookup(name)?;
        Ok(self.logs.recent(name, limit, min_level))
    }

    /// Put an agent on a maintenance hold. Scheduled cycles are skipped until
    /// it is resumed; manual triggers are refused.
    pub fn pause_agent(&self, name: &str) -> ConductorResult<()> {
        let entry = self.registry.lookup(name)?;
        entry.update(|s| match s.status {
            AgentStatus::Stopped => Err(ConductorError::InvalidState {
                agent: name.to_string(),
                reason: "cannot pause a stopped agent".into(),
            }),
            _ => {
                s.status = AgentStatus::Maintenance;
                Ok(())
            }
        })?;
        info!(agent = %name, "Orchestrator: agent paused");
        self.logs
            .record(name, LogLevel::Info, "Agent paused for maintenance", json!({}));
        Ok(())
    }

    /// Return a paused, stopped or failed agent to `Idle`, clearing quarantine.
    ///
    /// A stopped agent's loops are not restarted; call
    /// [`start_agent`](Self::start_agent) afterwards.
    pub fn resume_agent(&self, name: &str) -> ConductorResult<()> {
        let entry = self.registry.lookup(name)?;
        let previous = entry.update(|s| match s.status {
            AgentStatus::Maintenance | AgentStatus::Stopped | AgentStatus::Error => {
                let previous = s.status;
                s.status = AgentStatus::Idle;
                s.quarantined = false;
                s.consecutive_failures = 0;
                Ok(previous)
            }
            other => Err(ConductorError::InvalidState {
                agent: name.to_string(),
                reason: format!("cannot resume while {other}"),
            }),
        })?;
        info!(agent = %name, from = %previous, "Orchestrator: agent resumed");
        self.logs.record(
            name,
            LogLevel::Info,
            "Agent resumed",
            json!({ "from": previous }),
        );
        Ok(())
    }

    /// Start every enabled, startable agent in priority order and return the
    /// names started.
    pub fn start_all_agents(&self) -> Vec<String> {
        let mut started = Vec::new();
        for entry in self.registry.list(&AgentFilter::all()) {
            let name = entry.name();
            if !entry.config().enabled
                || self.scheduler.is_running(name)
                || !matches!(
                    entry.status(),
                    AgentStatus::Initializing | AgentStatus::Idle
                )
            {
                continue;
            }
            match self.start_agent(name) {
                Ok(()) => started.push(name.to_string()),
                Err(e) => warn!(agent = %name, error = %e, "Orchestrator: failed to start agent"),
            }
        }
        info!(count = started.len(), "Orchestrator: agents started");
        started
    }

    /// Stop every agent with a running loop, concurrently.
    pub async fn stop_all_agents(&self) -> Vec<String> {
        let names: Vec<String> = self
            .registry
            .list(&AgentFilter::all())
            .iter()
            .map(|entry| entry.name().to_string())
            .filter(|name| self.scheduler.is_running(name) || self.health.is_monitoring(name))
            .collect();

        let results = join_all(names.iter().map(|name| self.stop_agent(name))).await;
        let mut stopped = Vec::with_capacity(names.len());
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => stopped.push(name),
                Err(e) => warn!(agent = %name, error = %e, "Orchestrator: failed to stop agent"),
            }
        }
        stopped
    }

    /// Stop all agents and the bus maintenance task.
    pub async fn shutdown(&self) {
        self.stop_all_agents().await;
        let sweeper = self.sweeper.lock().take();
        if let Some((cancel, handle)) = sweeper {
            cancel.cancel();
            let _ = handle.await;
        }
        info!("Orchestrator: shut down");
    }

    /// Every agent's status report plus bus statistics, for dashboards.
    pub fn status_json(&self) -> serde_json::Value {
        json!({
            "generated_at": Utc::now(),
            "agents": self.list_agents(&AgentFilter::all()),
            "bus": self.bus.stats(),
        })
    }

    fn report(&self, entry: &AgentEntry) -> AgentStatusReport {
        let config = entry.config();
        let state = entry.state();
        let metrics = self.metrics.snapshot(&config.name);
        AgentStatusReport {
            name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
            priority: config.priority,
            enabled: config.enabled,
            capabilities: config.capabilities.clone(),
            dependencies: config.dependencies.clone(),
            heartbeat_stale: self.health.is_stale(&config.name, state.last_heartbeat),
            error_rate: metrics.error_rate(),
            state,
            metrics,
        }
    }

    /// Start the bus response-timeout sweep once.
    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            let cancel = CancellationToken::new();
            let handle = self
                .bus
                .clone()
                .spawn_sweeper(self.settings.bus_sweep_interval, cancel.clone());
            *sweeper = Some((cancel, handle));
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.scheduler.cancel_all();
        self.health.cancel_all();
        if let Some((cancel, _)) = self.sweeper.lock().take() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("agents", &self.registry.len())
            .finish_non_exhaustive()
    }
}
