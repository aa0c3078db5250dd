//! Request routing.
//!
//! One request runs one pipeline: the [`PlanGenerator`] proposes a plan, the
//! plan is repaired by [`normalize`], and the [`Executor`] runs it. [`Router`]
//! ties the pieces to a store and a completion service.

mod context;
mod executor;
mod generator;
mod normalizer;
mod plan;
mod prompt;

pub use context::{ExecutionContext, PROMPT_KEY};
pub use executor::{Execution, Executor, StepState, StepTrace, BOOTSTRAP_STEPS, MANDATORY_STEPS};
pub use generator::PlanGenerator;
pub use normalizer::normalize;
pub use plan::{PlanItem, ProposedStep, RawPlan, RoutingPlan, RoutingStep};
pub use prompt::{extract_model_name, render, GeneratedPrompt, PromptGenerator};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::agents::{AgentRegistry, AgentResult};
use crate::completion::{CompletionClient, CompletionRequest};
use crate::config::Config;
use crate::error::RouterError;
use crate::llm::LlmClient;
use crate::store::{InteractionLog, Store, UserId};

/// What a routed request produced.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub intent: String,
    pub app_id: Uuid,
    pub results: BTreeMap<String, AgentResult>,
    /// The normalized plan that was executed
    pub plan: Vec<RoutingStep>,
    /// Error markers the candidate plan contained
    pub plan_errors: Vec<String>,
}

/// Entry point: `(user, input, context)` in, results out.
pub struct Router {
    store: Arc<dyn Store>,
    registry: Arc<AgentRegistry>,
    generator: PlanGenerator,
    executor: Executor,
    default_model: String,
    temperature: f64,
    max_tokens: u64,
}

impl Router {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>, config: &Config) -> Self {
        Self::with_registry(store, llm, config, AgentRegistry::with_defaults())
    }

    pub fn with_registry(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmClient>,
        config: &Config,
        registry: AgentRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let completion = CompletionClient::new(llm, config.completion.timeout);
        Self {
            generator: PlanGenerator::new(completion.clone(), Arc::clone(&registry)),
            executor: Executor::new(
                Arc::clone(&registry),
                Arc::clone(&store),
                completion,
                config.interaction_log_limit,
            ),
            store,
            registry,
            default_model: config.default_model.clone(),
            temperature: config.completion.temperature,
            max_tokens: config.completion.max_tokens,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Route one request for `user_id`.
    ///
    /// Fails only when bootstrap fails or the user's agent profile cannot be
    /// loaded; every other failure is recorded in `results`.
    pub async fn route_request(
        &self,
        user_id: &str,
        input: &str,
        context: Value,
    ) -> Result<RouteOutcome, RouterError> {
        let user = UserId::new(user_id);
        let profile = self.store.agent_profile(&user, &self.default_model).await?;
        let context = ExecutionContext::from_value(context);
        tracing::info!("Routing request for {} with model {}: {}", user, profile.model, input);

        let request = CompletionRequest::new(&profile.model)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        let raw = self.generator.generate_plan(input, &context, &request).await;
        let plan = normalize(raw, &MANDATORY_STEPS);
        tracing::info!("Executing plan: {:?}", plan.agents());

        let outcome = self
            .executor
            .execute(&plan, &user, &profile.model, input, context.clone())
            .await
            .map(|execution| RouteOutcome {
                intent: execution.intent,
                app_id: execution.app_id,
                results: execution.results,
                plan: plan.steps.clone(),
                plan_errors: plan.errors.clone(),
            });

        let response = match &outcome {
            Ok(outcome) => serde_json::to_value(outcome).unwrap_or(Value::Null),
            Err(e) => e.to_value(),
        };
        let entry = InteractionLog {
            user_input: input.to_string(),
            agent_response: response,
            context: context.snapshot(),
        };
        if let Err(e) = self.store.log_interaction(&user, entry).await {
            tracing::warn!("Failed to log interaction for {}: {}", user, e);
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, Repository};
    use crate::testing::ScriptedLlm;
    use serde_json::json;

    const ROUTING_PROMPT_MARKER: &str = "optimal routing plan";

    fn router(llm: ScriptedLlm) -> (Router, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let config = Config::new("test-key".into(), "test-model".into());
        (Router::new(Arc::clone(&store) as Arc<dyn Store>, Arc::new(llm), &config), store)
    }

    #[tokio::test]
    async fn routes_a_developer_search_end_to_end() {
        let llm = ScriptedLlm::new(|prompt| {
            if prompt.contains(ROUTING_PROMPT_MARKER) {
                Ok(r#"[
                    {"agent": "IntentAgent", "order": 1, "task": "Identify intent", "dependencies": []},
                    {"agent": "CategoryAgent", "order": 2, "task": "Categorize", "dependencies": ["IntentAgent"]}
                ]"#
                .into())
            } else if prompt.contains("most appropriate intent") {
                Ok(r#"{"intent_name": "Unknown"}"#.into())
            } else if prompt.contains("appropriate category") {
                Ok(r#""Developers""#.into())
            } else {
                Ok(r#"{"fields": {"skill": "react", "years": 5, "remote": true}}"#.into())
            }
        });
        let (router, store) = router(llm);

        let outcome = router
            .route_request(
                "alice",
                "find me a react developer with 5 years experience, remote",
                json!({}),
            )
            .await
            .unwrap();

        let agents: Vec<&str> = outcome.plan.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(
            agents,
            vec!["IntentAgent", "CategoryAgent", "AppAgent", "RequestAgent"]
        );
        assert_eq!(outcome.plan[0].order, 1);

        // A placeholder answer never becomes the intent.
        assert_eq!(outcome.intent, "findReactDeveloper");
        assert!(outcome.results.values().all(AgentResult::is_success));
        assert_eq!(
            outcome.results["AppAgent"].detail_str("app_id"),
            Some(outcome.app_id.to_string())
        );

        let user = UserId::new("alice");
        let app = store.get_app(&user, outcome.app_id).await.unwrap().unwrap();
        assert_eq!(app.interaction_count, 1);
        let profile = store.agent_profile(&user, "other").await.unwrap();
        assert_eq!(profile.model, "test-model");
        assert_eq!(profile.interaction_count, 1);
    }

    #[tokio::test]
    async fn unparseable_plan_still_runs_mandatory_steps() {
        let (router, _store) = router(ScriptedLlm::new(|_| Ok("not json".into())));

        let outcome = router
            .route_request("bob", "book a table for two", json!({"channel": "cli"}))
            .await
            .unwrap();

        assert_eq!(outcome.plan_errors.len(), 1);
        assert!(outcome.plan_errors[0].contains("Invalid JSON"));
        let agents: Vec<&str> = outcome.plan.iter().map(|s| s.agent.as_str()).collect();
        assert_eq!(agents, vec!["IntentAgent", "AppAgent", "RequestAgent"]);

        let succeeded: Vec<&str> = outcome
            .results
            .iter()
            .filter(|(_, r)| r.is_success())
            .map(|(agent, _)| agent.as_str())
            .collect();
        assert_eq!(succeeded, vec!["AppAgent", "IntentAgent"]);
        assert_eq!(
            outcome.results["RequestAgent"].error_type(),
            Some("CapabilityError")
        );
    }

    #[tokio::test]
    async fn missing_dependency_is_skipped_and_execution_continues() {
        let llm = ScriptedLlm::new(|prompt| {
            if prompt.contains(ROUTING_PROMPT_MARKER) {
                Ok(r#"[
                    {"agent": "IntentAgent", "order": 1},
                    {"agent": "AppAgent", "order": 2, "dependencies": ["IntentAgent"]},
                    {"agent": "CategoryAgent", "order": 3, "dependencies": ["DynamicModelAgent"]},
                    {"agent": "UserInteractionAgent", "order": 4, "dependencies": ["AppAgent"]}
                ]"#
                .into())
            } else if prompt.contains("most appropriate intent") {
                Ok(r#"{"intent_name": "travelPlanning"}"#.into())
            } else {
                Ok(r#"{"fields": {"destination": "Lisbon"}}"#.into())
            }
        });
        let (router, _store) = router(llm);

        let outcome = router
            .route_request("carol", "plan a trip to Lisbon", json!({}))
            .await
            .unwrap();

        let category = &outcome.results["CategoryAgent"];
        assert_eq!(category.error_type(), Some("MissingDependency"));
        assert_eq!(category.error_message(), Some("Dependencies not met"));
        assert!(outcome.results["UserInteractionAgent"].is_success());
        assert!(outcome.results["RequestAgent"].is_success());
    }

    #[tokio::test]
    async fn bootstrap_failure_is_returned_and_logged() {
        let llm = ScriptedLlm::new(|prompt| {
            if prompt.contains(ROUTING_PROMPT_MARKER) {
                Ok("[]".into())
            } else {
                anyhow::bail!("upstream unavailable")
            }
        });
        let (router, store) = router(llm);

        let err = router
            .route_request("dave", "anything", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "BootstrapFailure");

        let profile = store
            .agent_profile(&UserId::new("dave"), "test-model")
            .await
            .unwrap();
        assert_eq!(profile.interaction_count, 1);
    }

    #[tokio::test]
    async fn repeated_requests_reuse_the_app() {
        let llm = ScriptedLlm::new(|prompt| {
            if prompt.contains(ROUTING_PROMPT_MARKER) {
                Ok("[]".into())
            } else if prompt.contains("most appropriate intent") {
                Ok(r#"{"intent_name": "findReactDeveloper"}"#.into())
            } else {
                Ok(r#"{"fields": {"skill": "react"}}"#.into())
            }
        });
        let (router, store) = router(llm);

        let first = router.route_request("erin", "react dev", json!({})).await.unwrap();
        let second = router.route_request("erin", "react dev again", json!({})).await.unwrap();
        assert_eq!(first.app_id, second.app_id);

        let app = store
            .get_app(&UserId::new("erin"), first.app_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(app.interaction_count, 2);
        assert_eq!(second.results["IntentAgent"].detail("is_new"), Some(&json!(false)));
    }
}
