//! Interaction recording.

use async_trait::async_trait;
use serde_json::json;

use super::{require_id, Agent, AgentContext, AgentError, AgentResult};
use crate::routing::ExecutionContext;
use crate::store::{now_string, CrudOperation, EntityKind};

pub struct UserInteractionAgent;

#[async_trait]
impl Agent for UserInteractionAgent {
    fn name(&self) -> &'static str {
        "UserInteractionAgent"
    }

    fn description(&self) -> &str {
        "Records the interaction with a context snapshot"
    }

    async fn process_task(
        &self,
        input: &str,
        task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::UserInteraction,
                json!({
                    "input": input,
                    "task": task,
                    "intent": context.intent(),
                    "app_id": context.app_id(),
                    "context": context.snapshot_without_prompt(),
                    "timestamp": now_string(),
                }),
            )
            .await?,
            "user interaction",
        )?;

        Ok(AgentResult::success()
            .with_detail("id", id.clone())
            .with_detail("interaction_id", id))
    }
}
