//! Per-capability prompt generation.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{json, Value};

use super::ExecutionContext;
use crate::agents::word_after;
use crate::store::{CrudOperation, EntityKind, Repository, StoreError, UserId};

const FALLBACK_TEMPLATE: &str = "Process the following request: {user_input}";

/// Template for an agent type, if one is defined.
fn template(agent_type: &str) -> Option<&'static str> {
    let template = match agent_type {
        "DynamicModel" => "For the input '{user_input}' and context {context}, update or create a dynamic model named '{model_name}'. You will be provided with existing fields. Avoid creating duplicate fields. You may update properties of existing fields if necessary. For new fields, ensure they don't conflict with existing ones. Format your response as JSON with 'updated_fields' and 'new_fields' arrays, each containing objects with 'name', 'field_type', and 'required' properties.",
        "Category" => "Analyze the following user input and determine the most appropriate category: User input: '{user_input}'. Context: {context}. Provide your response as a single category name (string).",
        "Intent" => "Determine the user's intent based on the following input: '{user_input}'. Context: {context}. Provide your response as a single intent name (string).",
        "UserProfile" => "Based on the user input '{user_input}' and context {context}, suggest appropriate fields for a user profile. Provide your response as a JSON array of objects, where each object represents a field with 'name' and 'value' properties.",
        "AIModel" => "Based on the task '{task}' and context {context}, determine the most appropriate AI model to use. Consider factors such as complexity, specific requirements, and any mentioned technologies or frameworks.",
        "Request" => "Analyze the following user request and suggest appropriate fields and values: User Input: '{user_input}'. Request Type: {request_type}. Provide your response as a JSON object with a 'fields' property containing key-value pairs of suggested fields and their values.",
        "App" => "Process the following request: '{user_input}'. Intent: {intent}. Create or update an app for this intent.",
        _ => return None,
    };
    Some(template)
}

/// A prompt ready to inject into a step's context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedPrompt {
    pub prompt: String,
    pub agent_type: String,
}

/// Builds the instruction for a capability from (input, task, context).
#[derive(Debug, Clone, Default)]
pub struct PromptGenerator;

impl PromptGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Template key for a capability: its name without the `Agent` suffix.
    pub fn agent_type(agent: &str) -> &str {
        match agent {
            "UserAppAgent" => "App",
            other => other.strip_suffix("Agent").unwrap_or(other),
        }
    }

    /// Build the prompt for `agent`.
    ///
    /// `DynamicModel` prompts read the model's existing fields from `repo`.
    pub async fn generate(
        &self,
        agent: &str,
        input: &str,
        task: &str,
        context: &ExecutionContext,
        user: &UserId,
        repo: &dyn Repository,
    ) -> Result<GeneratedPrompt, StoreError> {
        let agent_type = Self::agent_type(agent);
        let template = template(agent_type).unwrap_or(FALLBACK_TEMPLATE);
        let model_name = extract_model_name(input, context);

        let values = HashMap::from([
            ("user_input", input.to_string()),
            ("context", context.snapshot_without_prompt().to_string()),
            ("task", non_empty(task).unwrap_or("Unspecified task").to_string()),
            (
                "request_type",
                context
                    .get_str("request_type")
                    .unwrap_or("Unspecified request type")
                    .to_string(),
            ),
            (
                "intent",
                context.intent().unwrap_or("Unspecified intent").to_string(),
            ),
            ("model_name", model_name.clone()),
        ]);
        let mut prompt = render(template, &values);

        if agent_type == "DynamicModel" {
            let fields = existing_fields(user, repo, &model_name).await?;
            prompt.push_str(&format!("\n\nExisting fields: {}", Value::Array(fields)));
        }

        tracing::debug!("Generated prompt for {}: {}", agent_type, prompt);
        Ok(GeneratedPrompt {
            prompt,
            agent_type: agent_type.to_string(),
        })
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// Substitute `{name}` placeholders in one pass. Unknown placeholders stay,
/// and substituted text is never re-expanded.
pub fn render(template: &str, values: &HashMap<&str, String>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder =
        PLACEHOLDER.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("valid placeholder regex"));
    placeholder
        .replace_all(template, |caps: &Captures<'_>| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Dynamic model a request refers to: `context.model_name`, else the word
/// after `model`/`for` in the input, else `<intent>Model`.
pub fn extract_model_name(input: &str, context: &ExecutionContext) -> String {
    if let Some(name) = context.get_str("model_name") {
        return name.to_string();
    }
    if let Some(word) = word_after(input, &["model", "for"]) {
        return word.to_string();
    }
    format!("{}Model", context.intent().unwrap_or("General"))
}

/// `{name, field_type, required, choices}` of the model's current fields.
async fn existing_fields(
    user: &UserId,
    repo: &dyn Repository,
    model_name: &str,
) -> Result<Vec<Value>, StoreError> {
    let model = repo
        .perform(
            user,
            CrudOperation::Read,
            EntityKind::DynamicModel,
            object(json!({ "name": model_name })),
        )
        .await?;
    let Some(model_id) = model.is_success().then(|| model.id()).flatten() else {
        return Ok(Vec::new());
    };

    let fields = repo
        .perform(
            user,
            CrudOperation::Read,
            EntityKind::DynamicField,
            object(json!({ "model": model_id })),
        )
        .await?;
    if !fields.is_success() {
        return Ok(Vec::new());
    }

    Ok(fields
        .details
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|f| {
                    json!({
                        "name": f.get("name"),
                        "field_type": f.get("field_type"),
                        "required": f.get("required"),
                        "choices": f.get("choices"),
                    })
                })
                .collect()
        })
        .unwrap_or_default())
}

fn object(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}
