//! Session/app resolution (bootstrap).

use async_trait::async_trait;

use super::{Agent, AgentContext, AgentError, AgentResult};
use crate::error::RouterError;
use crate::routing::ExecutionContext;
use crate::store::InteractionEntry;

/// Gets or creates the user's app for the resolved intent and appends the
/// current request to its interaction log.
pub struct AppAgent;

impl AppAgent {
    /// Aggregate name for a (user, intent) pair.
    pub fn app_name(user: &str, intent: &str) -> String {
        format!("{}'s App - {}", user, intent)
    }
}

#[async_trait]
impl Agent for AppAgent {
    fn name(&self) -> &'static str {
        "AppAgent"
    }

    fn description(&self) -> &str {
        "Resolves the app aggregate for the request's intent"
    }

    async fn process_task(
        &self,
        input: &str,
        _task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let Some(intent) = context.intent() else {
            tracing::error!("No intent provided in context for {}", ctx.user);
            return Ok(RouterError::MissingDependency {
                agent: self.name().to_string(),
                missing: vec!["intent".to_string()],
            }
            .into_result());
        };

        let name = Self::app_name(ctx.user.as_str(), intent);
        let (app, created) = ctx.repo.get_or_create_app(ctx.user, &name, intent).await?;
        if created {
            tracing::info!("Created app {} ({})", app.name, app.id);
        }

        let entry = InteractionEntry::now(input, context.snapshot_without_prompt());
        let app = ctx
            .repo
            .append_interaction(ctx.user, app.id, entry, ctx.interaction_log_limit)
            .await?;

        Ok(AgentResult::success()
            .with_detail("app_id", app.id.to_string())
            .with_detail("app_name", app.name)
            .with_detail("created", created)
            .with_detail("intent", intent)
            .with_detail("interaction_count", app.interaction_count))
    }
}
