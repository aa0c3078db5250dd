//! Intent resolution (bootstrap).

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{excerpt, Agent, AgentContext, AgentError, AgentResult};
use crate::completion::Completion;
use crate::routing::ExecutionContext;
use crate::store::{Intent, NewIntent, StoreError};

const INTENT_SYSTEM_PROMPT: &str =
    "You are an AI assistant that classifies user requests into intents. Always respond with valid JSON.";

/// Names that carry no meaning and are never returned as an intent.
const PLACEHOLDER_NAMES: [&str; 4] = ["unknown", "generalquery", "general", "none"];

const STOP_WORDS: [&str; 24] = [
    "a", "an", "the", "me", "my", "i", "you", "to", "for", "with", "of", "and", "or", "in", "on",
    "at", "please", "can", "could", "would", "some", "is", "are", "be",
];

/// Matches the input against the user's intent catalog, creating a
/// user-owned intent when nothing fits.
pub struct IntentAgent;

/// Context key carrying the proposal made before the bootstrap transaction.
pub const PROPOSAL_KEY: &str = "intent_proposal";

impl IntentAgent {
    /// Ask the completion service to match or propose an intent.
    async fn propose(
        &self,
        input: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<NewIntent, AgentError> {
        let catalog = ctx.repo.intent_catalog(ctx.user).await?;
        let prompt = intent_prompt(input, context, &catalog);
        let request = ctx
            .request()
            .with_system(INTENT_SYSTEM_PROMPT)
            .with_temperature(0.3)
            .with_max_tokens(500)
            .json_object();
        let answer = ctx.complete(&prompt, &request).await?;
        let proposal = read_proposal(answer, input);
        tracing::info!("Intent proposal for {}: {}", ctx.user, proposal.name);
        Ok(proposal)
    }
}

#[async_trait]
impl Agent for IntentAgent {
    fn name(&self) -> &'static str {
        "IntentAgent"
    }

    fn description(&self) -> &str {
        "Classifies the request into a named intent"
    }

    async fn prepare(
        &self,
        input: &str,
        _task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<Map<String, Value>, AgentError> {
        let proposal = self.propose(input, context, ctx).await?;
        let mut staged = Map::new();
        staged.insert(PROPOSAL_KEY.to_string(), serde_json::to_value(proposal).map_err(StoreError::from)?);
        Ok(staged)
    }

    async fn process_task(
        &self,
        input: &str,
        _task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let staged = context
            .get(PROPOSAL_KEY)
            .and_then(|v| serde_json::from_value::<NewIntent>(v.clone()).ok());
        let proposal = match staged {
            Some(proposal) => proposal,
            None => self.propose(input, context, ctx).await?,
        };

        if let Some(existing) = ctx.repo.find_intent(ctx.user, &proposal.name).await? {
            return Ok(success(&existing, false));
        }

        let (intent, created) = ctx.repo.create_intent(ctx.user, proposal).await?;
        Ok(success(&intent, created))
    }
}

fn success(intent: &Intent, is_new: bool) -> AgentResult {
    AgentResult::success()
        .with_detail("intent", intent.name.clone())
        .with_detail("intent_id", intent.id.to_string())
        .with_detail("is_new", is_new)
}

fn intent_prompt(input: &str, context: &ExecutionContext, catalog: &[Intent]) -> String {
    let known: Vec<Value> = catalog
        .iter()
        .map(|i| {
            json!({
                "name": i.name,
                "description": i.description,
                "keywords": i.keywords,
                "scope": if i.user_id.is_some() { "user" } else { "global" },
            })
        })
        .collect();
    let known = serde_json::to_string_pretty(&known).unwrap_or_else(|_| "[]".to_string());

    format!(
        r#"Analyze the following user input and determine the most appropriate intent.
User input: "{input}"
Context: {context}

Existing intents:
{known}

Your task:
1. If the user's input matches an existing intent (global or user-specific), return that intent.
2. If no existing intent matches, create a new intent following the pattern of the global intents.

Provide your response in the following JSON format:
{{
    "intent_name": "Name of the intent (use camelCase)",
    "intent_description": "A brief description of the intent",
    "keywords": ["list", "of", "relevant", "keywords"],
    "is_existing": true/false
}}

Ensure that the intent_name is specific and meaningful, never return "Unknown" as an intent."#,
        input = input,
        context = context.snapshot_without_prompt(),
        known = known,
    )
}

/// Pull `{name, description, keywords}` out of whatever shape the answer has.
fn read_proposal(answer: Completion, input: &str) -> NewIntent {
    let answer = match answer {
        Completion::Text(text) => match Completion::Text(text.clone()).reparse() {
            Some(structured) => structured,
            None => Completion::Text(text),
        },
        structured => structured,
    };

    let (name, description, keywords) = match &answer {
        Completion::Text(text) => (bare_name(text), None, Vec::new()),
        other => match other.first_object() {
            Some(obj) => {
                let pick = |keys: &[&str]| {
                    keys.iter()
                        .find_map(|k| obj.get(*k).and_then(Value::as_str))
                        .map(|s| s.trim().to_string())
                };
                let keywords = obj
                    .get("keywords")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                (
                    pick(&["intent_name", "name", "intent"]),
                    pick(&["intent_description", "description"]),
                    keywords,
                )
            }
            None => (None, None, Vec::new()),
        },
    };

    let name = name
        .filter(|n| usable_name(n))
        .unwrap_or_else(|| synthesize_name(input));
    let description = description
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| format!("Intent for: {}", excerpt(input, 50)));

    NewIntent {
        name,
        description,
        keywords,
    }
}

/// A plain-text answer counts as a name only when it is a single token.
fn bare_name(text: &str) -> Option<String> {
    let text = text.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
    (!text.is_empty() && !text.contains(char::is_whitespace)).then(|| text.to_string())
}

fn usable_name(name: &str) -> bool {
    !name.is_empty() && !PLACEHOLDER_NAMES.contains(&name.to_lowercase().as_str())
}

/// camelCase name from the first salient words of the input.
pub(crate) fn synthesize_name(input: &str) -> String {
    let words: Vec<String> = input
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .take(3)
        .collect();

    if words.is_empty() {
        return "unclassifiedRequest".to_string();
    }

    let mut name = words[0].clone();
    for word in &words[1..] {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Repository;
    use crate::testing::{Harness, ScriptedLlm};

    #[test]
    fn synthesizes_specific_names() {
        assert_eq!(
            synthesize_name("find me a react developer with 5 years experience, remote"),
            "findReactDeveloper"
        );
        assert_eq!(synthesize_name("Plan a trip to Lisbon"), "planTripLisbon");
        assert_eq!(synthesize_name("  "), "unclassifiedRequest");
    }

    #[test]
    fn placeholder_answers_fall_back_to_synthesized_name() {
        let answer = Completion::parse(r#"{"intent_name": "Unknown"}"#);
        let proposal = read_proposal(answer, "find me a react developer");
        assert_eq!(proposal.name, "findReactDeveloper");

        let answer = Completion::parse("not json at all");
        let proposal = read_proposal(answer, "book a flight");
        assert_eq!(proposal.name, "bookFlight");
    }

    #[test]
    fn reads_array_and_encoded_answers() {
        let answer = Completion::parse(r#"[{"intent_name": "travelPlanning", "keywords": ["trip"]}]"#);
        let proposal = read_proposal(answer, "x");
        assert_eq!(proposal.name, "travelPlanning");
        assert_eq!(proposal.keywords, vec!["trip"]);

        let answer = Completion::parse(r#""{\"intent_name\": \"hireDesigner\"}""#);
        assert_eq!(read_proposal(answer, "x").name, "hireDesigner");
    }

    #[tokio::test]
    async fn creates_then_reuses_intent() {
        let harness = Harness::new(ScriptedLlm::new(|_| {
            Ok(r#"{"intent_name": "findReactDeveloper", "intent_description": "Hire React devs", "keywords": ["react"]}"#.to_string())
        }));
        let ctx = harness.ctx();
        let context = ExecutionContext::new();

        let first = IntentAgent
            .process_task("find me a react developer", "Determine user intent", &context, &ctx)
            .await
            .unwrap();
        assert!(first.is_success());
        assert_eq!(first.detail_str("intent").as_deref(), Some("findReactDeveloper"));
        assert_eq!(first.detail("is_new"), Some(&Value::Bool(true)));

        let second = IntentAgent
            .process_task("another react developer", "Determine user intent", &context, &ctx)
            .await
            .unwrap();
        assert_eq!(second.detail("is_new"), Some(&Value::Bool(false)));
        assert_eq!(second.detail("intent_id"), first.detail("intent_id"));
    }

    #[tokio::test]
    async fn prompt_lists_the_catalog() {
        let llm = ScriptedLlm::new(|_| Ok(r#"{"intent_name": "travelPlanning"}"#.to_string()));
        let prompts = llm.prompts();
        let harness = Harness::new(llm);
        harness
            .store
            .add_global_intent(NewIntent {
                name: "travelPlanning".into(),
                description: "Plan trips".into(),
                keywords: vec![],
            })
            .await
            .unwrap();

        let result = IntentAgent
            .process_task("plan a trip", "t", &ExecutionContext::new(), &harness.ctx())
            .await
            .unwrap();
        assert_eq!(result.detail("is_new"), Some(&Value::Bool(false)));
        assert!(prompts.lock().unwrap()[0].contains("\"travelPlanning\""));
    }

    #[tokio::test]
    async fn staged_proposal_skips_the_completion_call() {
        let llm = ScriptedLlm::new(|_| Ok(r#"{"intent_name": "hireDesigner"}"#.to_string()));
        let prompts = llm.prompts();
        let harness = Harness::new(llm);
        let ctx = harness.ctx();

        let staged = IntentAgent
            .prepare("need a designer", "t", &ExecutionContext::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(prompts.lock().unwrap().len(), 1);
        assert!(harness.store.intent_catalog(&harness.user).await.unwrap().is_empty());

        let context = ExecutionContext::from(staged);
        let result = IntentAgent
            .process_task("need a designer", "t", &context, &ctx)
            .await
            .unwrap();
        assert_eq!(result.detail_str("intent").as_deref(), Some("hireDesigner"));
        assert_eq!(prompts.lock().unwrap().len(), 1);
    }
}
