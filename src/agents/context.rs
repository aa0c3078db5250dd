//! Services handed to an agent for one task.

use serde_json::{Map, Value};

use crate::completion::{Completion, CompletionClient, CompletionError, CompletionRequest};
use crate::routing::{ExecutionContext, PromptGenerator};
use crate::store::{CrudOperation, CrudOutcome, EntityKind, Repository, StoreError, UserId};

/// Shared context passed to an agent while it processes a task.
///
/// The repository is the request's bootstrap transaction while bootstrap
/// steps run and the plain store afterwards, so handlers never need to know
/// which one they write through.
pub struct AgentContext<'a> {
    /// User the request acts for
    pub user: &'a UserId,

    /// Persistence for this step
    pub repo: &'a dyn Repository,

    /// Completion service
    pub completion: &'a CompletionClient,

    /// Model from the user's agent profile
    pub model: &'a str,

    /// Builds prompts when a handler needs one the executor did not inject
    pub prompts: &'a PromptGenerator,

    /// Rolling interaction log size for app aggregates
    pub interaction_log_limit: usize,
}

impl<'a> AgentContext<'a> {
    /// Completion request for this user's model.
    pub fn request(&self) -> CompletionRequest {
        CompletionRequest::new(self.model)
    }

    pub async fn complete(
        &self,
        prompt: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, CompletionError> {
        self.completion.complete(prompt, request).await
    }

    /// The prompt injected for this step, or a freshly generated one.
    pub async fn step_prompt(
        &self,
        agent: &str,
        input: &str,
        task: &str,
        context: &ExecutionContext,
    ) -> Result<String, StoreError> {
        if let Some(prompt) = context.prompt() {
            return Ok(prompt.to_string());
        }
        let generated = self
            .prompts
            .generate(agent, input, task, context, self.user, self.repo)
            .await?;
        Ok(generated.prompt)
    }

    /// Generic CRUD as the acting user.
    pub async fn perform(
        &self,
        op: CrudOperation,
        kind: EntityKind,
        data: Value,
    ) -> Result<CrudOutcome, StoreError> {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.repo.perform(self.user, op, kind, data).await
    }
}
