use crate::types::{AgentConfig, AgentFilter, AgentState};
use crate::work::AgentWork;
use chrono::{DateTime, Utc};
use conductor_core::{AgentStatus, ConductorError, ConductorResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle to the execution currently running for an agent.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub abort: AbortHandle,
}

/// Mutable runtime state of one agent.
///
/// Written by that agent's scheduler and health loops; everyone else reads
/// snapshots through [`AgentEntry::state`].
#[derive(Debug)]
pub struct AgentRuntimeState {
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub quarantined: bool,
    pub heartbeat_failures: u32,
    pub heartbeat_degraded: bool,
    pub registered_at: DateTime<Utc>,
    pub(crate) in_flight: Option<InFlight>,
}

impl AgentRuntimeState {
    fn new() -> Self {
        Self {
            status: AgentStatus::Initializing,
            last_heartbeat: None,
            consecutive_failures: 0,
            quarantined: false,
            heartbeat_failures: 0,
            heartbeat_degraded: false,
            registered_at: Utc::now(),
            in_flight: None,
        }
    }

    fn snapshot(&self) -> AgentState {
        AgentState {
            status: self.status,
            last_heartbeat: self.last_heartbeat,
            in_flight: self.in_flight.as_ref().map(|f| f.id),
            running_since: self.in_flight.as_ref().map(|f| f.started_at),
            consecutive_failures: self.consecutive_failures,
            quarantined: self.quarantined,
            heartbeat_degraded: self.heartbeat_degraded,
            registered_at: self.registered_at,
        }
    }
}

/// A registered agent: configuration, work function and runtime state.
pub struct AgentEntry {
    config: Arc<AgentConfig>,
    work: Arc<dyn AgentWork>,
    state: RwLock<AgentRuntimeState>,
    exec_lock: Arc<Mutex<()>>,
}

impl AgentEntry {
    fn new(config: AgentConfig, work: Arc<dyn AgentWork>) -> Self {
        Self {
            config: Arc::new(config),
            work,
            state: RwLock::new(AgentRuntimeState::new()),
            exec_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    pub(crate) fn work(&self) -> Arc<dyn AgentWork> {
        self.work.clone()
    }

    /// Snapshot of the last committed state. Never waits on the execution lock.
    pub fn state(&self) -> AgentState {
        self.state.read().snapshot()
    }

    pub fn status(&self) -> AgentStatus {
        self.state.read().status
    }

    /// Apply a mutation under this agent's state lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut AgentRuntimeState) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Whether an execution currently holds the single-flight lock.
    pub fn is_executing(&self) -> bool {
        self.exec_lock.try_lock().is_err()
    }

    /// Take the single-flight lock without waiting.
    pub(crate) fn try_begin_execution(&self) -> ConductorResult<OwnedMutexGuard<()>> {
        self.exec_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| ConductorError::Busy(self.config.name.clone()))
    }

    /// Resolves once no execution is in flight.
    pub(crate) async fn wait_for_execution(&self) {
        let _guard = self.exec_lock.lock().await;
    }

    /// Signal the in-flight execution's cancellation token.
    pub(crate) fn cancel_in_flight(&self) -> bool {
        match &self.state.read().in_flight {
            Some(flight) => {
                flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort the in-flight execution's task outright.
    pub(crate) fn abort_in_flight(&self) -> bool {
        match &self.state.read().in_flight {
            Some(flight) => {
                flight.cancel.cancel();
                flight.abort.abort();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEntry")
            .field("config", &self.config)
            .field("state", &self.state.read().snapshot())
            .finish_non_exhaustive()
    }
}

/// Concurrent map of registered agents keyed by name.
///
/// Locking is per agent: the map itself is sharded and every entry carries its
/// own state lock, so operations on different agents never contend.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<AgentEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert a new agent in the `Initializing` state.
    pub fn register(
        &self,
        config: AgentConfig,
        work: Arc<dyn AgentWork>,
    ) -> ConductorResult<Arc<AgentEntry>> {
        config.validate()?;
        match self.agents.entry(config.name.clone()) {
            Entry::Occupied(_) => Err(ConductorError::DuplicateAgent(config.name)),
            Entry::Vacant(slot) => {
                let entry = Arc::new(AgentEntry::new(config, work));
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentEntry>> {
        self.agents.get(name).map(|e| e.value().clone())
    }

    /// Like [`get`](Self::get) but with a not-found error.
    pub fn lookup(&self, name: &str) -> ConductorResult<Arc<AgentEntry>> {
        self.get(name)
            .ok_or_else(|| ConductorError::AgentNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Configuration and state snapshot of one agent.
    pub fn snapshot(&self, name: &str) -> ConductorResult<(Arc<AgentConfig>, AgentState)> {
        let entry = self.lookup(name)?;
        Ok((entry.config().clone(), entry.state()))
    }

    /// Agents matching `filter`, critical priority first, then by name.
    pub fn list(&self, filter: &AgentFilter) -> Vec<Arc<AgentEntry>> {
        let mut entries: Vec<Arc<AgentEntry>> = self
            .agents
            .iter()
            .map(|e| e.value().clone())
            .filter(|entry| {
                let config = entry.config();
                if let Some(cap) = &filter.capability {
                    if !config.capabilities.contains(cap) {
                        return false;
                    }
                }
                let state = entry.state();
                if filter.status.is_some_and(|s| s != state.status) {
                    return false;
                }
                if filter
                    .heartbeat_degraded
                    .is_some_and(|d| d != state.heartbeat_degraded)
                {
                    return false;
                }
                true
            })
            .collect();
        entries.sort_by(|a, b| {
            b.config()
                .priority
                .cmp(&a.config().priority)
                .then_with(|| a.name().cmp(b.name()))
        });
        entries
    }

    /// Mutate one agent's runtime state and return the resulting snapshot.
    pub fn update_state(
        &self,
        name: &str,
        transition: impl FnOnce(&mut AgentRuntimeState),
    ) -> ConductorResult<AgentState> {
        let entry = self.lookup(name)?;
        entry.update(transition);
        Ok(entry.state())
    }

    /// Dependencies of `config` that are missing or unhealthy.
    pub fn unsatisfied_dependencies(&self, config: &AgentConfig) -> Vec<String> {
        config
            .dependencies
            .iter()
            .filter(|dep| {
                !self
                    .get(dep)
                    .is_some_and(|entry| entry.status().satisfies_dependency())
            })
            .cloned()
            .collect()
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<AgentEntry>> {
        self.agents.remove(name).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
