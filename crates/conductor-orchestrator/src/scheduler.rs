use crate::bus::MessageBus;
use crate::config::OrchestratorSettings;
use crate::logs::{LogLevel, LogStore};
use crate::metrics::MetricsCollector;
use crate::registry::{AgentEntry, AgentRegistry, InFlight};
use crate::types::{AgentConfig, ExecutionOutcome, Trigger};
use crate::work::AgentContext;
use chrono::{DateTime, Utc};
use conductor_core::{
    AgentStatus, ConductorError, ConductorResult, PlatformFacade, ResultSummary,
};
use cron::Schedule;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Parse a cron expression string into a [`cron::Schedule`].
///
/// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
pub fn parse_cron(cron_expr: &str) -> ConductorResult<Schedule> {
    Schedule::from_str(cron_expr).map_err(|e| {
        ConductorError::Config(format!("Invalid cron expression '{cron_expr}': {e}"))
    })
}

/// Compute the next fire time for a given cron expression.
///
/// Returns the first upcoming `DateTime<Utc>` after `Utc::now()`, or an error
/// if the expression is invalid or has no upcoming times.
pub fn next_fire_time(cron_expr: &str) -> ConductorResult<DateTime<Utc>> {
    let schedule = parse_cron(cron_expr)?;
    schedule.upcoming(Utc).next().ok_or_else(|| {
        ConductorError::Scheduler(format!(
            "Cron expression '{cron_expr}' has no upcoming fire times"
        ))
    })
}

/// How a failed attempt is recorded: error kind plus verbatim description.
#[derive(Debug)]
struct Failure {
    kind: String,
    description: String,
}

impl From<ConductorError> for Failure {
    fn from(err: ConductorError) -> Self {
        Self {
            kind: err.kind().to_string(),
            description: err.to_string(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug)]
struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs one independent scheduling loop per started agent.
///
/// Each loop waits for the agent's interval (or cron fire time), checks
/// dependency gating and quarantine, then executes the agent's work on its own
/// task under the agent's single-flight lock and execution timeout.
pub struct ExecutionScheduler {
    registry: Arc<AgentRegistry>,
    metrics: Arc<MetricsCollector>,
    logs: Arc<LogStore>,
    bus: Arc<MessageBus>,
    platform: Arc<dyn PlatformFacade>,
    settings: OrchestratorSettings,
    loops: DashMap<String, LoopHandle>,
}

impl ExecutionScheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        metrics: Arc<MetricsCollector>,
        logs: Arc<LogStore>,
        bus: Arc<MessageBus>,
        platform: Arc<dyn PlatformFacade>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            metrics,
            logs,
            bus,
            platform,
            settings,
            loops: DashMap::new(),
        }
    }

    /// Spawn the scheduling loop for `entry`. An interval agent runs its first
    /// attempt immediately; a cron agent waits for its first fire time.
    pub fn start(self: &Arc<Self>, entry: Arc<AgentEntry>) -> ConductorResult<()> {
        match self.loops.entry(entry.name().to_string()) {
            Entry::Occupied(_) => Err(ConductorError::InvalidState {
                agent: entry.name().to_string(),
                reason: "scheduling loop is already running".into(),
            }),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let this = Arc::clone(self);
                let token = cancel.clone();
                let handle = tokio::spawn(async move { this.run_loop(entry, token).await });
                slot.insert(LoopHandle { cancel, handle });
                Ok(())
            }
        }
    }

    /// Whether a scheduling loop is running for `name`.
    pub fn is_running(&self, name: &str) -> bool {
        self.loops.contains_key(name)
    }

    /// Cancel every scheduling loop and in-flight execution without waiting.
    pub(crate) fn cancel_all(&self) {
        let names: Vec<String> = self.loops.iter().map(|l| l.key().clone()).collect();
        for name in names {
            if let Some((_, l)) = self.loops.remove(&name) {
                l.cancel.cancel();
                l.handle.abort();
            }
            if let Some(entry) = self.registry.get(&name) {
                entry.abort_in_flight();
            }
        }
    }

    async fn run_loop(self: Arc<Self>, entry: Arc<AgentEntry>, cancel: CancellationToken) {
        let name = entry.name().to_string();
        tracing::info!(agent = %name, "Scheduler: loop started");
        let mut delay = if entry.config().schedule.is_some() {
            self.next_delay(entry.config())
                .unwrap_or_else(|e| self.fault(&entry, &e))
        } else {
            Duration::ZERO
        };
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = match guard_cycle(self.run_cycle(&entry)).await {
                Ok(()) => self
                    .next_delay(entry.config())
                    .unwrap_or_else(|e| self.fault(&entry, &e)),
                Err(e) => self.fault(&entry, &e),
            };
        }
        tracing::info!(agent = %name, "Scheduler: loop exited");
    }

    /// Record an internal loop fault, move the agent to Error and return the
    /// cool-down to wait before the next cycle.
    fn fault(&self, entry: &AgentEntry, err: &ConductorError) -> Duration {
        let cool_down = self.settings.fault_cool_down;
        tracing::error!(
            agent = %entry.name(),
            error = %err,
            cool_down_ms = cool_down.as_millis() as u64,
            "Scheduler: internal fault, cooling down"
        );
        entry.update(|s| {
            if !matches!(s.status, AgentStatus::Stopped | AgentStatus::Maintenance) {
                s.status = AgentStatus::Error;
            }
        });
        self.logs.record(
            entry.name(),
            LogLevel::Error,
            "Scheduler fault; cooling down",
            json!({ "error": err.to_string(), "cool_down_ms": cool_down.as_millis() as u64 }),
        );
        cool_down
    }

    /// One scheduled cycle: gating checks, then at most one execution.
    async fn run_cycle(&self, entry: &Arc<AgentEntry>) -> ConductorResult<()> {
        let config = entry.config();
        let state = entry.state();

        if !config.enabled {
            tracing::debug!(agent = %config.name, "Scheduler: agent disabled, skipping cycle");
            return Ok(());
        }
        if matches!(state.status, AgentStatus::Maintenance | AgentStatus::Stopped) {
            tracing::debug!(agent = %config.name, status = %state.status, "Scheduler: agent held, skipping cycle");
            return Ok(());
        }
        if state.quarantined {
            tracing::debug!(agent = %config.name, "Scheduler: agent quarantined, skipping cycle");
            return Ok(());
        }

        let missing = self.registry.unsatisfied_dependencies(config);
        if !missing.is_empty() {
            let err = ConductorError::DependencyNotSatisfied(missing.join(", "));
            tracing::warn!(agent = %config.name, missing = ?missing, "Scheduler: {err}; skipping cycle");
            self.logs.record(
                &config.name,
                LogLevel::Warn,
                "Dependencies not satisfied; cycle skipped",
                json!({ "missing": missing }),
            );
            return Ok(());
        }

        match self.execute(entry, Trigger::Scheduled, serde_json::Value::Null).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_busy() => {
                tracing::debug!(agent = %config.name, "Scheduler: execution in flight, skipping cycle");
                Ok(())
            }
            Err(ConductorError::InvalidState { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run the agent's work once under the single-flight lock and timeout.
    ///
    /// Fails fast with [`ConductorError::Busy`] when an execution is already in
    /// flight. A failed or timed-out attempt is still `Ok`: the outcome carries
    /// `success == false` and the failure is recorded in metrics and logs.
    pub async fn execute(
        &self,
        entry: &Arc<AgentEntry>,
        trigger: Trigger,
        params: serde_json::Value,
    ) -> ConductorResult<ExecutionOutcome> {
        let name = entry.name().to_string();
        ensure_runnable(&name, entry.status())?;
        let _guard = entry.try_begin_execution()?;

        let config = Arc::clone(entry.config());
        let execution_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let ctx = AgentContext::new(
            name.clone(),
            trigger,
            params,
            config.options.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.platform),
            cancel.clone(),
        );
        let work = entry.work();
        let started = Instant::now();

        let mut handle = entry.update(|s| {
            ensure_runnable(&name, s.status)?;
            let handle = tokio::spawn(async move { work.execute(ctx).await });
            s.status = AgentStatus::Running;
            s.in_flight = Some(InFlight {
                id: execution_id,
                started_at: Utc::now(),
                cancel: cancel.clone(),
                abort: handle.abort_handle(),
            });
            Ok::<_, ConductorError>(handle)
        })?;
        tracing::info!(agent = %name, execution_id = %execution_id, trigger = ?trigger, "Scheduler: execution started");

        let result: Result<ResultSummary, Failure> =
            match tokio::time::timeout(config.execution_timeout, &mut handle).await {
                Ok(Ok(Ok(summary))) => Ok(summary),
                Ok(Ok(Err(e))) => Err(e.into()),
                Ok(Err(join_err)) if join_err.is_panic() => Err(Failure {
                    kind: "panic".into(),
                    description: format!(
                        "Work function panicked: {}",
                        panic_message(join_err.into_panic())
                    ),
                }),
                Ok(Err(_)) => Err(Failure {
                    kind: "cancelled".into(),
                    description: "Execution was aborted".into(),
                }),
                Err(_) => {
                    cancel.cancel();
                    handle.abort();
                    let _ = handle.await;
                    Err(ConductorError::Timeout(config.execution_timeout).into())
                }
            };

        Ok(self.commit(entry, &config, execution_id, trigger, started.elapsed(), result))
    }

    /// Record metrics, logs and the resulting status of one attempt. Runs
    /// while the single-flight lock is still held.
    fn commit(
        &self,
        entry: &AgentEntry,
        config: &AgentConfig,
        execution_id: Uuid,
        trigger: Trigger,
        elapsed: Duration,
        result: Result<ResultSummary, Failure>,
    ) -> ExecutionOutcome {
        let name = &config.name;
        let duration_ms = elapsed.as_millis() as u64;
        let mut outcome = ExecutionOutcome {
            execution_id,
            agent: name.clone(),
            trigger,
            success: result.is_ok(),
            duration_ms,
            summary: None,
            error_kind: None,
            error: None,
            finished_at: Utc::now(),
        };

        match result {
            Ok(summary) => {
                self.metrics.record_success(name, elapsed, &summary);
                entry.update(|s| {
                    s.in_flight = None;
                    s.consecutive_failures = 0;
                    s.quarantined = false;
                    if s.status == AgentStatus::Running {
                        s.status = AgentStatus::Idle;
                    }
                });
                tracing::info!(agent = %name, execution_id = %execution_id, duration_ms, "Scheduler: execution succeeded");
                self.logs.record(
                    name,
                    LogLevel::Info,
                    format!("Execution succeeded: {}", summary.summary),
                    json!({
                        "execution_id": execution_id,
                        "trigger": trigger,
                        "duration_ms": duration_ms,
                        "data": summary.data,
                    }),
                );
                outcome.summary = Some(summary);
            }
            Err(failure) => {
                self.metrics
                    .record_failure(name, &failure.kind, &failure.description);
                let (streak, newly_quarantined) = entry.update(|s| {
                    s.in_flight = None;
                    s.consecutive_failures += 1;
                    let newly = !s.quarantined && s.consecutive_failures > config.max_retries;
                    if newly {
                        s.quarantined = true;
                    }
                    if s.status == AgentStatus::Running {
                        s.status = AgentStatus::Error;
                    }
                    (s.consecutive_failures, newly)
                });
                tracing::warn!(
                    agent = %name,
                    execution_id = %execution_id,
                    kind = %failure.kind,
                    error = %failure.description,
                    consecutive_failures = streak,
                    "Scheduler: execution failed"
                );
                self.logs.record(
                    name,
                    LogLevel::Error,
                    format!("Execution failed: {}", failure.description),
                    json!({
                        "execution_id": execution_id,
                        "trigger": trigger,
                        "duration_ms": duration_ms,
                        "kind": failure.kind,
                        "consecutive_failures": streak,
                    }),
                );
                if newly_quarantined {
                    tracing::error!(agent = %name, failures = streak, "Scheduler: retry budget exhausted, agent quarantined");
                    self.logs.record(
                        name,
                        LogLevel::Error,
                        "Retry budget exhausted; agent quarantined",
                        json!({ "max_retries": config.max_retries }),
                    );
                }
                outcome.error_kind = Some(failure.kind);
                outcome.error = Some(failure.description);
            }
        }
        outcome
    }

    /// Stop `entry`'s loop and wait for any in-flight execution.
    ///
    /// The agent is marked `Stopped` first and its in-flight execution is
    /// signalled to cancel. If it has not finished within the grace period,
    /// `force` aborts it and logs a forced stop; otherwise `Busy` is returned.
    pub async fn stop(&self, entry: &Arc<AgentEntry>, force: bool) -> ConductorResult<()> {
        let name = entry.name().to_string();
        let loop_handle = self.loops.remove(&name).map(|(_, l)| l);
        if let Some(l) = &loop_handle {
            l.cancel.cancel();
        }
        entry.update(|s| s.status = AgentStatus::Stopped);
        entry.cancel_in_flight();

        let grace = self.settings.stop_grace_period;
        let drained = tokio::time::timeout(grace, entry.wait_for_execution())
            .await
            .is_ok();

        if !drained {
            if !force {
                tracing::warn!(agent = %name, grace_ms = grace.as_millis() as u64, "Scheduler: execution still in flight after grace period");
                return Err(ConductorError::Busy(name));
            }
            tracing::warn!(agent = %name, grace_ms = grace.as_millis() as u64, "Scheduler: forced stop, aborting in-flight execution");
            self.logs.record(
                &name,
                LogLevel::Warn,
                "Forced stop after grace period",
                json!({ "grace_ms": grace.as_millis() as u64 }),
            );
            entry.abort_in_flight();
        }

        if let Some(l) = loop_handle {
            let mut handle = l.handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                entry.update(|s| s.in_flight = None);
            }
        }
        tracing::info!(agent = %name, "Scheduler: agent stopped");
        Ok(())
    }

    /// Delay before the next cycle: the time to the next cron fire when a
    /// schedule is set, otherwise the execution interval.
    pub fn next_delay(&self, config: &AgentConfig) -> ConductorResult<Duration> {
        match &config.schedule {
            Some(expr) => {
                let next = next_fire_time(expr)?;
                Ok((next - Utc::now()).to_std().unwrap_or_default())
            }
            None => Ok(config.execution_interval),
        }
    }
}

impl std::fmt::Debug for ExecutionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionScheduler")
            .field("settings", &self.settings)
            .field("loops", &self.loops.len())
            .finish_non_exhaustive()
    }
}

/// Run one scheduling cycle, turning a panic outside the work task into an
/// internal fault so the loop survives it.
async fn guard_cycle<F>(cycle: F) -> ConductorResult<()>
where
    F: Future<Output = ConductorResult<()>>,
{
    match AssertUnwindSafe(cycle).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ConductorError::Scheduler(format!(
            "Scheduling cycle panicked: {}",
            panic_message(payload)
        ))),
    }
}

fn ensure_runnable(agent: &str, status: AgentStatus) -> ConductorResult<()> {
    match status {
        AgentStatus::Stopped | AgentStatus::Maintenance => Err(ConductorError::InvalidState {
            agent: agent.to_string(),
            reason: format!("cannot execute while {status}"),
        }),
        _ => Ok(()),
    }
}
