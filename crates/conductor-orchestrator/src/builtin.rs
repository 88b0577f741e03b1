use crate::work::{AgentContext, AgentWork};
use async_trait::async_trait;
use conductor_core::{ConductorResult, ResultSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Work variants that can be selected from a config file.
///
/// ```toml
/// [agents.work]
/// kind = "platform_action"
/// action = "sync_inventory"
/// params = { warehouse = "eu-1" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuiltinAgent {
    /// Succeeds immediately.
    Noop,
    /// Succeeds with a fixed summary, echoing manual-trigger params as data.
    Echo { summary: String },
    /// Drains the agent's queue, acknowledging response-required messages.
    Inbox {
        #[serde(default = "default_max_messages")]
        max_messages: usize,
    },
    /// Runs one platform action. Manual-trigger params override `params`.
    PlatformAction {
        action: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

fn default_max_messages() -> usize {
    100
}

impl BuiltinAgent {
    pub fn into_work(self) -> Arc<dyn AgentWork> {
        Arc::new(self)
    }
}

#[async_trait]
impl AgentWork for BuiltinAgent {
    async fn execute(&self, ctx: AgentContext) -> ConductorResult<ResultSummary> {
        match self {
            BuiltinAgent::Noop => Ok(ResultSummary::text("noop")),
            BuiltinAgent::Echo { summary } => {
                Ok(ResultSummary::text(summary.clone()).with_data(ctx.params.clone()))
            }
            BuiltinAgent::Inbox { max_messages } => {
                let mut processed = 0usize;
                let mut replied = 0usize;
                for message in ctx.bus.poll_batch(&ctx.agent, *max_messages) {
                    if message.response_required {
                        ctx.bus.send(message.reply(json!({
                            "ack": true,
                            "subject": message.subject,
                        })))?;
                        replied += 1;
                    }
                    ctx.bus.mark_processed(message.id)?;
                    processed += 1;
                }
                Ok(
                    ResultSummary::text(format!("Processed {processed} message(s)"))
                        .with_data(json!({ "processed": processed, "replied": replied })),
                )
            }
            BuiltinAgent::PlatformAction { action, params } => {
                let params = if ctx.params.is_null() {
                    params
                } else {
                    &ctx.params
                };
                let result = ctx.platform.execute_action(action, params).await?;
                Ok(ResultSummary::text(format!("Action '{action}' completed")).with_data(result))
            }
        }
    }
}
