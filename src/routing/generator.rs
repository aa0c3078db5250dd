//! Plan generation through the completion service.

use std::sync::Arc;

use serde_json::Value;

use super::plan::{PlanItem, RawPlan};
use super::ExecutionContext;
use crate::agents::AgentRegistry;
use crate::completion::{Completion, CompletionClient, CompletionRequest};
use crate::error::RouterError;

const ROUTING_SYSTEM_PROMPT: &str =
    "You are an AI assistant that helps with routing decisions. Always respond with valid JSON.";

/// Turns (input, context) into a candidate plan.
pub struct PlanGenerator {
    completion: CompletionClient,
    registry: Arc<AgentRegistry>,
}

impl PlanGenerator {
    pub fn new(completion: CompletionClient, registry: Arc<AgentRegistry>) -> Self {
        Self {
            completion,
            registry,
        }
    }

    /// Instruction listing every registered capability.
    pub fn routing_prompt(&self, input: &str, context: &ExecutionContext) -> String {
        let agents = self.registry.names().join(", ");
        format!(
            r#"As a RouterAgent, analyze the following user input and context to determine the optimal routing plan:

User Input: "{input}"
Context: {context}

Available Agents: {agents}

Provide your routing plan as a JSON array of objects. Your response MUST be a valid JSON array starting with '[' and ending with ']'. Each object in the array should represent an agent call with the following structure:
{{
    "agent": "AgentName",
    "order": int,
    "task": "Description of the task",
    "dependencies": ["AgentName1", "AgentName2"]
}}

Example of a valid response:
[
    {{
        "agent": "IntentAgent",
        "order": 1,
        "task": "Identify user intent",
        "dependencies": []
    }},
    {{
        "agent": "CategoryAgent",
        "order": 2,
        "task": "Categorize the request",
        "dependencies": ["IntentAgent"]
    }}
]

Ensure your response is a single JSON array containing all the agent calls. Do not include any text before or after the JSON array."#,
            input = input,
            context = context.snapshot(),
            agents = agents,
        )
    }

    /// Ask for a plan. Never fails: anything unusable comes back as a single
    /// error marker so normalization can still add the mandatory steps.
    pub async fn generate_plan(
        &self,
        input: &str,
        context: &ExecutionContext,
        request: &CompletionRequest,
    ) -> RawPlan {
        let prompt = self.routing_prompt(input, context);
        let request = request.clone().with_system(ROUTING_SYSTEM_PROMPT);

        let plan = match self.completion.complete(&prompt, &request).await {
            Ok(answer) => self.read_plan(answer),
            Err(e) => {
                let err = RouterError::PlanGeneration(e.to_string());
                tracing::error!("{} (input: {})", err, input);
                vec![PlanItem::error(err.to_string(), None)]
            }
        };
        tracing::info!("Candidate routing plan has {} entries", plan.len());
        plan
    }

    /// Normalize all three answer shapes to a list of entries.
    pub fn read_plan(&self, answer: Completion) -> RawPlan {
        let items = match answer {
            Completion::Array(items) => items,
            Completion::Object(obj) => vec![Value::Object(obj)],
            Completion::Text(text) => match Completion::Text(text.clone()).reparse() {
                Some(structured) => return self.read_plan(structured),
                None => {
                    let err = RouterError::PlanGeneration("Invalid JSON".to_string());
                    tracing::warn!("{}: {}", err, text);
                    return vec![PlanItem::error(err.to_string(), Some(text))];
                }
            },
        };

        items
            .iter()
            .map(|item| match PlanItem::from_value(item) {
                PlanItem::Step(mut step) => {
                    step.agent = self.registry.canonical_name(&step.agent).to_string();
                    for dep in &mut step.dependencies {
                        *dep = self.registry.canonical_name(dep).to_string();
                    }
                    PlanItem::Step(step)
                }
                marker => marker,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;
    use std::time::Duration;

    fn generator(answer: &'static str) -> PlanGenerator {
        let llm = ScriptedLlm::new(move |_| Ok(answer.to_string()));
        PlanGenerator::new(
            CompletionClient::new(Arc::new(llm), Duration::from_secs(5)),
            Arc::new(AgentRegistry::with_defaults()),
        )
    }

    fn agents(plan: &RawPlan) -> Vec<String> {
        plan.iter()
            .filter_map(|item| match item {
                PlanItem::Step(s) => Some(s.agent.clone()),
                PlanItem::Error { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn accepts_array_object_and_encoded_answers() {
        let request = CompletionRequest::new("m");
        let ctx = ExecutionContext::new();

        let plan = generator(r#"[{"agent": "IntentAgent"}, {"agent": "CategoryAgent"}]"#)
            .generate_plan("x", &ctx, &request)
            .await;
        assert_eq!(agents(&plan), vec!["IntentAgent", "CategoryAgent"]);

        let plan = generator(r#"{"agent": "CategoryAgent", "order": 1}"#)
            .generate_plan("x", &ctx, &request)
            .await;
        assert_eq!(agents(&plan), vec!["CategoryAgent"]);

        let plan = generator(r#""[{\"agent\": \"RequestAgent\"}]""#)
            .generate_plan("x", &ctx, &request)
            .await;
        assert_eq!(agents(&plan), vec!["RequestAgent"]);

        let plan = generator("```json\n[{\"agent\": \"AIModelAgent\"}]\n```")
            .generate_plan("x", &ctx, &request)
            .await;
        assert_eq!(agents(&plan), vec!["AIModelAgent"]);
    }

    #[tokio::test]
    async fn unparseable_answer_is_a_single_marker() {
        let plan = generator("not json")
            .generate_plan("x", &ExecutionContext::new(), &CompletionRequest::new("m"))
            .await;
        assert_eq!(plan.len(), 1);
        let PlanItem::Error { error, raw } = &plan[0] else {
            panic!("expected marker");
        };
        assert!(error.contains("Invalid JSON"));
        assert_eq!(raw.as_deref(), Some("not json"));
    }

    #[tokio::test]
    async fn transport_failure_is_a_marker() {
        let llm = ScriptedLlm::new(|_| anyhow::bail!("connection reset"));
        let generator = PlanGenerator::new(
            CompletionClient::new(Arc::new(llm), Duration::from_secs(5)),
            Arc::new(AgentRegistry::with_defaults()),
        );
        let plan = generator
            .generate_plan("x", &ExecutionContext::new(), &CompletionRequest::new("m"))
            .await;
        assert!(matches!(&plan[..], [PlanItem::Error { .. }]));
    }

    #[test]
    fn aliases_are_canonicalised() {
        let plan = generator("")
            .read_plan(Completion::parse(r#"[{"agent": "UserAppAgent", "dependencies": ["IntentAgent"]}, {"agent": "X", "dependencies": ["UserAppAgent"]}]"#));
        let PlanItem::Step(first) = &plan[0] else { panic!() };
        let PlanItem::Step(second) = &plan[1] else { panic!() };
        assert_eq!(first.agent, "AppAgent");
        assert_eq!(second.dependencies, vec!["AppAgent"]);
    }

    #[test]
    fn prompt_lists_capabilities() {
        let prompt = generator("").routing_prompt("hello", &ExecutionContext::new());
        assert!(prompt.contains("Available Agents: AIModelAgent, AppAgent, CategoryAgent"));
        assert!(prompt.contains(r#"User Input: "hello""#));
    }
}
