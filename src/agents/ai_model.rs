//! AI model selection.

use async_trait::async_trait;
use serde_json::json;

use super::{require_id, Agent, AgentContext, AgentError, AgentResult};
use crate::routing::ExecutionContext;
use crate::store::{CrudOperation, EntityKind};

const DEFAULT_COST_PER_TOKEN: f64 = 0.0001;

/// Picks a model for the task and records it with provider and pricing.
pub struct AiModelAgent;

impl AiModelAgent {
    pub fn model_for(task: &str, context: &ExecutionContext) -> &'static str {
        let task = task.to_lowercase();
        if task.contains("complex") {
            "gpt-4"
        } else if task.contains("code")
            || context
                .intent()
                .is_some_and(|i| i.eq_ignore_ascii_case("FindReactDeveloper"))
        {
            "gemma2-9b-it"
        } else {
            "gpt-3.5-turbo"
        }
    }

    pub fn provider(model: &str) -> &'static str {
        if model.starts_with("gpt") {
            "openai"
        } else if model.starts_with("gemma") {
            "groq"
        } else {
            "custom"
        }
    }

    pub fn is_free(model: &str) -> bool {
        model == "gemma2-9b-it"
    }

    pub fn cost_per_token(model: &str) -> f64 {
        match model {
            "gpt-4" => 0.0002,
            "gpt-3.5-turbo" => 0.00001,
            "gemma2-9b-it" => 0.0001,
            _ => DEFAULT_COST_PER_TOKEN,
        }
    }
}

#[async_trait]
impl Agent for AiModelAgent {
    fn name(&self) -> &'static str {
        "AIModelAgent"
    }

    fn description(&self) -> &str {
        "Selects the AI model suited to the task"
    }

    async fn process_task(
        &self,
        _input: &str,
        task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let model = Self::model_for(task, context);
        let provider = Self::provider(model);
        let is_free = Self::is_free(model);
        let cost = Self::cost_per_token(model);

        let id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::AiModel,
                json!({
                    "name": model,
                    "provider": provider,
                    "is_free": is_free,
                    "cost_per_token": cost,
                }),
            )
            .await?,
            "AI model",
        )?;

        Ok(AgentResult::success()
            .with_detail("id", id)
            .with_detail("model_name", model)
            .with_detail("provider", provider)
            .with_detail("is_free", is_free)
            .with_detail("cost_per_token", cost))
    }
}
