//! Plan execution.
//!
//! The bootstrap steps run first, inside one store transaction: either both
//! succeed and commit, or the request aborts and nothing they wrote survives.
//! Every other step then runs in plan order, skipped when a dependency did
//! not succeed. A failing step never stops the steps after it.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::plan::{RoutingPlan, RoutingStep};
use super::{ExecutionContext, PromptGenerator, PROMPT_KEY};
use crate::agents::{Agent, AgentContext, AgentRegistry, AgentResult};
use crate::completion::CompletionClient;
use crate::error::RouterError;
use crate::store::{LinkedResource, Repository, Store, UserId};

/// Capabilities every normalized plan contains.
pub const MANDATORY_STEPS: [&str; 3] = ["IntentAgent", "AppAgent", "RequestAgent"];

/// Capabilities that run before everything else, all-or-nothing.
pub const BOOTSTRAP_STEPS: [&str; 2] = ["IntentAgent", "AppAgent"];

/// Capabilities whose created resource is attached to the app.
const LINKED_STEPS: [&str; 2] = ["DynamicModelAgent", "CategoryAgent"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Completed,
    Failed,
    Skipped,
}

/// What happened to one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepTrace {
    pub agent: String,
    pub order: u32,
    pub state: StepState,
    pub elapsed_ms: u64,
}

/// Outcome of running a plan.
#[derive(Debug, Clone)]
pub struct Execution {
    pub intent: String,
    pub app_id: Uuid,
    /// Results keyed by capability name
    pub results: BTreeMap<String, AgentResult>,
    pub trace: Vec<StepTrace>,
    /// Final context, with every result merged in
    pub context: ExecutionContext,
}

pub struct Executor {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    completion: CompletionClient,
    prompts: PromptGenerator,
    interaction_log_limit: usize,
}

impl Executor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn Store>,
        completion: CompletionClient,
        interaction_log_limit: usize,
    ) -> Self {
        Self {
            registry,
            store,
            completion,
            prompts: PromptGenerator::new(),
            interaction_log_limit,
        }
    }

    fn agent_context<'a>(
        &'a self,
        user: &'a UserId,
        model: &'a str,
        repo: &'a dyn Repository,
    ) -> AgentContext<'a> {
        AgentContext {
            user,
            repo,
            completion: &self.completion,
            model,
            prompts: &self.prompts,
            interaction_log_limit: self.interaction_log_limit,
        }
    }

    /// Run a normalized plan for `user`.
    ///
    /// Only a bootstrap failure (or failing to open or commit its
    /// transaction) is returned as `Err`.
    pub async fn execute(
        &self,
        plan: &RoutingPlan,
        user: &UserId,
        model: &str,
        input: &str,
        mut context: ExecutionContext,
    ) -> Result<Execution, RouterError> {
        let mut results = BTreeMap::new();
        let mut trace = Vec::with_capacity(plan.steps.len());

        let (intent, app_id) = self
            .bootstrap(plan, user, model, input, &mut context, &mut results, &mut trace)
            .await?;

        for step in &plan.steps {
            if BOOTSTRAP_STEPS.contains(&step.agent.as_str()) {
                continue;
            }
            let started = Instant::now();

            let missing: Vec<String> = step
                .dependencies
                .iter()
                .filter(|dep| !results.get(dep.as_str()).is_some_and(AgentResult::is_success))
                .cloned()
                .collect();

            let (result, state) = if !missing.is_empty() {
                tracing::info!(
                    "Skipping {} on task '{}' (input: {}): dependencies not met {:?}",
                    step.agent,
                    step.task,
                    input,
                    missing
                );
                let result = RouterError::MissingDependency {
                    agent: step.agent.clone(),
                    missing: missing.clone(),
                }
                .into_result()
                .with_detail("error_message", "Dependencies not met")
                .with_detail("missing", missing);
                (result, StepState::Skipped)
            } else {
                let result = self.run_step(step, user, model, input, &context).await;
                let state = if result.is_success() {
                    StepState::Completed
                } else {
                    StepState::Failed
                };
                (result, state)
            };

            if result.is_success() && LINKED_STEPS.contains(&step.agent.as_str()) {
                self.link_in_background(user, app_id, &step.agent, &result);
            }

            context.insert_result(&step.agent, &result);
            results.insert(step.agent.clone(), result);
            trace.push(StepTrace {
                agent: step.agent.clone(),
                order: step.order,
                state,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let snapshot: Map<String, Value> = results
            .iter()
            .map(|(agent, result)| (agent.clone(), result.to_value()))
            .collect();
        if let Err(e) = self
            .store
            .record_results(user, app_id, Value::Object(snapshot))
            .await
        {
            tracing::warn!("Failed to record results on app {}: {}", app_id, e);
        }

        Ok(Execution {
            intent,
            app_id,
            results,
            trace,
            context,
        })
    }

    /// Run the bootstrap steps and return `(intent, app_id)`.
    ///
    /// Each step's `prepare` (completion calls) runs against the plain store
    /// first; only the writes of `process_task` happen inside the transaction.
    #[allow(clippy::too_many_arguments)]
    async fn bootstrap(
        &self,
        plan: &RoutingPlan,
        user: &UserId,
        model: &str,
        input: &str,
        context: &mut ExecutionContext,
        results: &mut BTreeMap<String, AgentResult>,
        trace: &mut Vec<StepTrace>,
    ) -> Result<(String, Uuid), RouterError> {
        let mut staged = context.clone();
        let mut steps = Vec::with_capacity(BOOTSTRAP_STEPS.len());

        for name in BOOTSTRAP_STEPS {
            let started = Instant::now();
            let step = plan
                .step(name)
                .cloned()
                .unwrap_or_else(|| RoutingStep::new(name, 0, ""));
            let agent = self
                .registry
                .resolve(name)
                .map_err(|e| bootstrap_failure(name, e.into_result()))?;

            let ctx = self.agent_context(user, model, self.store.repository());
            let entries = prepare(agent.as_ref(), input, &step.task, &staged, &ctx)
                .await
                .map_err(|result| bootstrap_failure(name, result))?;
            for (key, value) in entries {
                staged.insert(key, value);
            }
            steps.push((step, agent, started));
        }

        let tx = self.store.begin().await?;
        let mut intent = None;
        let mut app_id = None;

        for (step, agent, started) in steps {
            let name = agent.name();
            let result = {
                let ctx = self.agent_context(user, model, tx.repository());
                dispatch(agent.as_ref(), input, &step.task, &staged, &ctx).await
            };

            let failure = if !result.is_success() {
                Some(result.error_message().unwrap_or("Unknown error").to_string())
            } else if name == "IntentAgent" {
                intent = result.detail_str("intent");
                intent.is_none().then(|| "No intent was resolved".to_string())
            } else {
                app_id = result
                    .detail_str("app_id")
                    .and_then(|id| Uuid::parse_str(&id).ok());
                app_id.is_none().then(|| "No app was resolved".to_string())
            };

            if let Some(message) = failure {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!("Rollback after failed bootstrap: {}", e);
                }
                tracing::error!("Bootstrap step {} failed: {}", name, message);
                return Err(RouterError::Bootstrap {
                    agent: name.to_string(),
                    message,
                    result: Some(Box::new(result)),
                });
            }

            for target in [&mut staged, &mut *context] {
                if let Some(intent) = &intent {
                    target.insert("intent", intent.clone());
                }
                if let Some(app_id) = app_id {
                    target.insert("app_id", app_id.to_string());
                }
                target.insert_result(name, &result);
            }
            results.insert(name.to_string(), result);
            trace.push(StepTrace {
                agent: name.to_string(),
                order: step.order,
                state: StepState::Completed,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        tx.commit().await?;

        match (intent, app_id) {
            (Some(intent), Some(app_id)) => {
                tracing::info!("Bootstrap committed: intent {} app {}", intent, app_id);
                Ok((intent, app_id))
            }
            _ => Err(RouterError::bootstrap("AppAgent", "Bootstrap incomplete")),
        }
    }

    /// Resolve, prepare and dispatch one non-bootstrap step.
    async fn run_step(
        &self,
        step: &RoutingStep,
        user: &UserId,
        model: &str,
        input: &str,
        context: &ExecutionContext,
    ) -> AgentResult {
        let agent = match self.registry.resolve(&step.agent) {
            Ok(agent) => agent,
            Err(e) => {
                tracing::warn!("{} for task '{}' (input: {})", e, step.task, input);
                return e.into_result();
            }
        };

        let repo = self.store.repository();
        let generated = match self
            .prompts
            .generate(&step.agent, input, &step.task, context, user, repo)
            .await
        {
            Ok(generated) => generated,
            Err(e) => {
                tracing::warn!("Prompt for {} failed (input: {}): {}", step.agent, input, e);
                return RouterError::Capability {
                    agent: step.agent.clone(),
                    message: e.to_string(),
                }
                .into_result()
                .with_detail("cause", "PersistenceError");
            }
        };

        let mut step_context = context.clone();
        step_context.insert(PROMPT_KEY, generated.prompt);
        step_context.insert("agent_type", generated.agent_type);

        tracing::debug!("Dispatching {} (order {})", step.agent, step.order);
        let ctx = self.agent_context(user, model, repo);
        dispatch(agent.as_ref(), input, &step.task, &step_context, &ctx).await
    }

    /// Attach the step's created resource to the app without waiting.
    fn link_in_background(&self, user: &UserId, app_id: Uuid, agent: &str, result: &AgentResult) {
        let Some(resource_id) = ["id", "category_id", "model_id"]
            .iter()
            .find_map(|key| result.detail_str(key))
        else {
            return;
        };
        let resource = LinkedResource {
            kind: agent.strip_suffix("Agent").unwrap_or(agent).to_string(),
            resource_id,
        };
        let store = Arc::clone(&self.store);
        let user = user.clone();
        tokio::spawn(async move {
            if let Err(e) = store.link_resource(&user, app_id, resource).await {
                tracing::warn!("Failed to link resource to app {}: {}", app_id, e);
            }
        });
    }
}

/// Invoke a handler, turning errors and panics into error results.
async fn dispatch(
    agent: &dyn Agent,
    input: &str,
    task: &str,
    context: &ExecutionContext,
    ctx: &AgentContext<'_>,
) -> AgentResult {
    let outcome = AssertUnwindSafe(agent.process_task(input, task, context, ctx))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(result)) => with_error_fields(result),
        Ok(Err(e)) => agent_failure(agent.name(), task, input, &e.to_string(), e.kind()),
        Err(panic) => agent_failure(agent.name(), task, input, &panic_message(panic.as_ref()), "Panic"),
    }
}

/// Run a handler's `prepare`, with the same error capture as [`dispatch`].
async fn prepare(
    agent: &dyn Agent,
    input: &str,
    task: &str,
    context: &ExecutionContext,
    ctx: &AgentContext<'_>,
) -> Result<Map<String, Value>, AgentResult> {
    let outcome = AssertUnwindSafe(agent.prepare(input, task, context, ctx))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(entries)) => Ok(entries),
        Ok(Err(e)) => Err(agent_failure(agent.name(), task, input, &e.to_string(), e.kind())),
        Err(panic) => Err(agent_failure(
            agent.name(),
            task,
            input,
            &panic_message(panic.as_ref()),
            "Panic",
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

fn agent_failure(agent: &str, task: &str, input: &str, message: &str, cause: &str) -> AgentResult {
    if cause == "Panic" {
        tracing::error!("{} panicked on task '{}' (input: {}): {}", agent, task, input, message);
    } else {
        tracing::warn!("{} failed on task '{}' (input: {}): {}", agent, task, input, message);
    }
    RouterError::Capability {
        agent: agent.to_string(),
        message: message.to_string(),
    }
    .into_result()
    .with_detail("cause", cause)
}

fn bootstrap_failure(agent: &str, result: AgentResult) -> RouterError {
    let message = result.error_message().unwrap_or("Unknown error").to_string();
    tracing::error!("Bootstrap step {} failed: {}", agent, message);
    RouterError::Bootstrap {
        agent: agent.to_string(),
        message,
        result: Some(Box::new(result)),
    }
}

/// Error results always name their message and type.
fn with_error_fields(mut result: AgentResult) -> AgentResult {
    if !result.is_success() {
        result
            .details
            .entry("error_message")
            .or_insert_with(|| Value::String("Unknown error".to_string()));
        result
            .details
            .entry("error_type")
            .or_insert_with(|| Value::String("CapabilityError".to_string()));
    }
    result
}
