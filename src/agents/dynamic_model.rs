//! Dynamic model maintenance.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{require_id, Agent, AgentContext, AgentError, AgentResult};
use crate::completion::Completion;
use crate::routing::{extract_model_name, ExecutionContext};
use crate::store::{CrudOperation, EntityKind};

const DYNAMIC_MODEL_SYSTEM_PROMPT: &str = "You are an AI assistant that helps with creating and updating dynamic models. Always respond with valid JSON.";

/// Creates or extends a user-defined model with fields proposed by the
/// completion service.
pub struct DynamicModelAgent;

#[async_trait]
impl Agent for DynamicModelAgent {
    fn name(&self) -> &'static str {
        "DynamicModelAgent"
    }

    fn description(&self) -> &str {
        "Creates or updates a dynamic model"
    }

    async fn process_task(
        &self,
        input: &str,
        task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let model_name = extract_model_name(input, context);
        tracing::info!("Using model_name: {}", model_name);

        let model_id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::DynamicModel,
                json!({
                    "name": model_name,
                    "description": format!("Dynamic model for: {}", model_name),
                }),
            )
            .await?,
            "dynamic model",
        )?;

        let prompt = ctx.step_prompt(self.name(), input, task, context).await?;
        let request = ctx
            .request()
            .with_system(DYNAMIC_MODEL_SYSTEM_PROMPT)
            .with_temperature(0.7)
            .with_max_tokens(1000)
            .json_object();
        let proposed = field_proposals(ctx.complete(&prompt, &request).await?)?;

        let mut upserted = 0usize;
        for field in &proposed {
            let Some(name) = field.get("name").and_then(Value::as_str) else {
                let field = Value::Object(field.clone());
                tracing::warn!("Skipping field data without name: {}", field);
                continue;
            };

            let existing = ctx
                .perform(
                    CrudOperation::Read,
                    EntityKind::DynamicField,
                    json!({ "model": model_id, "name": name }),
                )
                .await?;

            let outcome = match existing.is_success().then(|| existing.id()).flatten() {
                Some(field_id) => {
                    let mut changes = Map::new();
                    changes.insert("id".to_string(), Value::String(field_id));
                    for key in ["field_type", "required", "choices"] {
                        if let Some(value) = field.get(key) {
                            changes.insert(key.to_string(), value.clone());
                        }
                    }
                    ctx.perform(CrudOperation::Update, EntityKind::DynamicField, Value::Object(changes))
                        .await?
                }
                None => {
                    ctx.perform(
                        CrudOperation::Create,
                        EntityKind::DynamicField,
                        json!({
                            "model": model_id,
                            "name": name,
                            "field_type": field.get("field_type").cloned().unwrap_or_else(|| json!("CharField")),
                            "required": field.get("required").cloned().unwrap_or(Value::Bool(false)),
                            "choices": field.get("choices").cloned().unwrap_or(Value::Null),
                        }),
                    )
                    .await?
                }
            };

            if outcome.is_success() {
                upserted += 1;
            } else {
                tracing::warn!(
                    "Failed to upsert field {} on {}: {:?}",
                    name,
                    model_name,
                    outcome.error_message()
                );
            }
        }

        Ok(AgentResult::success()
            .with_detail("id", model_id.clone())
            .with_detail("model_id", model_id)
            .with_detail("model_name", model_name)
            .with_detail("fields_upserted", upserted))
    }
}

/// Field objects from `{updated_fields, new_fields}` or a bare array.
fn field_proposals(answer: Completion) -> Result<Vec<Map<String, Value>>, AgentError> {
    let answer = answer
        .reparse()
        .ok_or_else(|| AgentError::InvalidResponse("dynamic model answer is not JSON".to_string()))?;

    let items: Vec<Value> = match answer {
        Completion::Array(items) => items,
        Completion::Object(obj) => ["updated_fields", "new_fields"]
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_array))
            .flatten()
            .cloned()
            .collect(),
        Completion::Text(_) => Vec::new(),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            other => {
                tracing::warn!("Skipping invalid field data: {}", other);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Repository;
    use crate::testing::{Harness, ScriptedLlm};

    #[test]
    fn accepts_object_and_array_answers() {
        let obj = Completion::parse(
            r#"{"updated_fields": [{"name": "a"}], "new_fields": [{"name": "b"}, 3]}"#,
        );
        assert_eq!(field_proposals(obj).unwrap().len(), 2);

        let arr = Completion::parse(r#"[{"name": "c"}]"#);
        assert_eq!(field_proposals(arr).unwrap().len(), 1);

        assert!(field_proposals(Completion::parse("no")).is_err());
    }

    #[tokio::test]
    async fn upserts_fields_without_duplicates() {
        let harness = Harness::new(ScriptedLlm::new(|_| {
            Ok(r#"{"updated_fields": [], "new_fields": [
                {"name": "title", "field_type": "CharField", "required": true},
                {"name": "servings", "field_type": "IntegerField"},
                {"field_type": "TextField", "required": false}
            ]}"#
            .to_string())
        }));
        let ctx = harness.ctx();
        let context = ExecutionContext::from_value(json!({"model_name": "Recipe"}));

        let first = DynamicModelAgent.process_task("recipes", "t", &context, &ctx).await.unwrap();
        let second = DynamicModelAgent.process_task("recipes", "t", &context, &ctx).await.unwrap();

        assert_eq!(first.detail_str("model_name").as_deref(), Some("Recipe"));
        assert_eq!(first.detail("fields_upserted"), Some(&json!(2)));
        assert_eq!(first.detail("model_id"), second.detail("model_id"));

        let fields = harness
            .store
            .perform(
                &harness.user,
                CrudOperation::Read,
                EntityKind::DynamicField,
                json!({"model": first.detail_str("model_id").unwrap()}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(fields.details.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn generated_prompt_mentions_existing_fields() {
        let llm = ScriptedLlm::new(|_| Ok(r#"[{"name": "title"}]"#.to_string()));
        let prompts = llm.prompts();
        let harness = Harness::new(llm);
        let context = ExecutionContext::from_value(json!({"model_name": "Recipe"}));

        DynamicModelAgent.process_task("recipes", "t", &context, &harness.ctx()).await.unwrap();
        DynamicModelAgent.process_task("recipes", "t", &context, &harness.ctx()).await.unwrap();

        let prompts = prompts.lock().unwrap();
        assert!(prompts[0].contains("Existing fields: []"));
        assert!(prompts[1].contains(r#""name":"title""#));
    }
}
