use crate::bus::MessageBus;
use crate::types::Trigger;
use async_trait::async_trait;
use conductor_core::{ConductorResult, PlatformFacade, ResultSummary};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a work function may touch during one execution.
#[derive(Clone)]
pub struct AgentContext {
    /// Name of the agent being executed.
    pub agent: String,
    pub trigger: Trigger,
    /// Parameters passed to execute-now; `Null` for scheduled runs.
    pub params: serde_json::Value,
    /// The agent's configured `options` map.
    pub options: serde_json::Map<String, serde_json::Value>,
    pub bus: Arc<MessageBus>,
    pub platform: Arc<dyn PlatformFacade>,
    cancel: CancellationToken,
}

impl AgentContext {
    pub(crate) fn new(
        agent: String,
        trigger: Trigger,
        params: serde_json::Value,
        options: serde_json::Map<String, serde_json::Value>,
        bus: Arc<MessageBus>,
        platform: Arc<dyn PlatformFacade>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            trigger,
            params,
            options,
            bus,
            platform,
            cancel,
        }
    }

    /// Whether the orchestrator asked this execution to wind down.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the execution is cancelled (timeout or stop).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("agent", &self.agent)
            .field("trigger", &self.trigger)
            .field("params", &self.params)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The recurring unit of work an agent performs.
///
/// Implementations must tolerate being dropped at any `.await` point: a
/// timed-out or force-stopped execution is aborted, not awaited.
#[async_trait]
pub trait AgentWork: Send + Sync {
    /// Run one execution and return its summary.
    async fn execute(&self, ctx: AgentContext) -> ConductorResult<ResultSummary>;
}

/// [`AgentWork`] backed by an async closure. Build with [`work_fn`].
pub struct FnWork<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> AgentWork for FnWork<F>
where
    F: Fn(AgentContext) -> Fut + Send + Sync,
    Fut: Future<Output = ConductorResult<ResultSummary>> + Send,
{
    async fn execute(&self, ctx: AgentContext) -> ConductorResult<ResultSummary> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as shareable agent work.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn AgentWork>
where
    F: Fn(AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConductorResult<ResultSummary>> + Send + 'static,
{
    Arc::new(FnWork { f })
}
